//! Upstream spawn and the two relay loops.
//!
//! One task pumps client stdin toward the upstream, one pumps upstream
//! stdout back to the client, and a third forwards upstream stderr
//! verbatim. The loops share the session behind a single mutex that is
//! never held across an await point; the client-side writer sits behind
//! an async lock so line writes stay atomic.

use crate::config::ProxyConfig;
use crate::framing::{self, InboundLine};
use crate::intercept::{
    self, handle_tools_call_response, handle_tools_list_result, ToolsListConditional,
};
use crate::lazy::{self, SEARCH_TOOL_NAME};
use crate::session::{PendingRequest, ProxySession};
use crate::signals;
use crate::tools_hash;
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use ulmp_core::{json_size, make_cache_key};

type SharedSession = Arc<Mutex<ProxySession>>;
type ClientWriter = Arc<tokio::sync::Mutex<tokio::io::Stdout>>;

/// Resolves a bare upstream executable name against `PATH`, probing the
/// Windows `.cmd`/`.exe` shims when the plain name is not found.
fn resolve_upstream_command(command: &[String]) -> Vec<String> {
    let Some(first) = command.first() else {
        return command.to_vec();
    };
    if first.contains('/') || first.contains(std::path::MAIN_SEPARATOR) {
        return command.to_vec();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return command.to_vec();
    };
    let mut candidates = vec![first.clone()];
    if cfg!(windows) {
        candidates.push(format!("{first}.cmd"));
        candidates.push(format!("{first}.exe"));
    }
    for dir in std::env::split_paths(&path_var) {
        for name in &candidates {
            let candidate = dir.join(name);
            if candidate.is_file() {
                let mut resolved = vec![candidate.to_string_lossy().into_owned()];
                resolved.extend_from_slice(&command[1..]);
                return resolved;
            }
        }
    }
    command.to_vec()
}

fn trace_inbound(trace_rpc: bool, msg: &Value) {
    if !trace_rpc {
        return;
    }
    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let kind = if msg.get("id").is_some_and(|id| !id.is_null()) {
            "request"
        } else {
            "notification"
        };
        tracing::trace!(target: "ulmp::rpc", direction = "client", kind, method, id = ?msg.get("id"));
    }
}

fn trace_upstream(trace_rpc: bool, msg: &Value, origin: Option<&str>) {
    if !trace_rpc {
        return;
    }
    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let kind = if msg.get("id").is_some_and(|id| !id.is_null()) {
            "request"
        } else {
            "notification"
        };
        tracing::trace!(target: "ulmp::rpc", direction = "upstream", kind, method, id = ?msg.get("id"));
    } else if msg.get("id").is_some_and(|id| !id.is_null()) {
        let status = if msg.get("result").is_some() {
            "result"
        } else if msg.get("error").is_some() {
            "error"
        } else {
            "?"
        };
        tracing::trace!(
            target: "ulmp::rpc",
            direction = "upstream",
            kind = "response",
            id = ?msg.get("id"),
            origin = origin.unwrap_or("?"),
            status,
        );
    }
}

/// Ships one message to the client, attaching the runtime-metrics
/// snapshot to result objects when stats are on.
async fn send_to_client(
    writer: &ClientWriter,
    session: &SharedSession,
    cfg: &ProxyConfig,
    mut msg: Value,
) -> std::io::Result<()> {
    if cfg.stats {
        let snapshot = session.lock().metrics.runtime_snapshot();
        if let Some(result) = msg.get_mut("result").and_then(Value::as_object_mut) {
            let ext = result
                .entry(tools_hash::EXTENSION_KEY.to_string())
                .or_insert_with(|| json!({}));
            if let Some(ext) = ext.as_object_mut() {
                ext.insert("runtime_metrics".into(), snapshot);
            }
        }
    }
    let mut out = writer.lock().await;
    framing::write_message(&mut *out, &msg).await
}

/// Intercepts one client request. Returns a complete response when the
/// proxy can answer locally (conditional not-modified, search meta-tool,
/// cache hit); otherwise records the pending entry and returns `None`.
fn intercept_request(
    msg: &Value,
    method: &str,
    req_id: &Value,
    session: &SharedSession,
    cfg: &ProxyConfig,
    profile_fingerprint: &str,
) -> Option<Value> {
    let jsonrpc = msg
        .get("jsonrpc")
        .cloned()
        .unwrap_or_else(|| json!("2.0"));
    let respond = |result: Value| {
        json!({"jsonrpc": jsonrpc.clone(), "id": req_id, "result": result})
    };
    let mut session = session.lock();

    match method {
        "initialize" => {
            session.pending_insert(
                req_id,
                PendingRequest {
                    method: method.to_string(),
                    client_tools_hash_sync_supported: tools_hash::client_supports_tools_hash_sync(
                        msg.get("params"),
                    ),
                    ..Default::default()
                },
            );
            None
        }
        "tools/list" => {
            let (provided, valid, value) =
                tools_hash::extract_if_none_match(msg.get("params"), &cfg.tools_hash_sync_algorithm);
            if cfg.tools_hash_sync_enabled && session.tools_hash_negotiated && valid {
                if let Some(value) = value.as_deref() {
                    if let Some(result) = intercept::try_tools_list_short_circuit(
                        &mut session,
                        cfg,
                        profile_fingerprint,
                        value,
                    ) {
                        return Some(respond(result));
                    }
                }
            }
            session.pending_insert(
                req_id,
                PendingRequest {
                    method: method.to_string(),
                    if_none_match: value,
                    if_none_match_provided: provided,
                    if_none_match_valid: valid,
                    ..Default::default()
                },
            );
            None
        }
        "tools/call" => {
            let (tool_name, arguments) = intercept::extract_tool_call(msg);

            // The lazy discovery meta-tool is handled fully in the proxy.
            if cfg.lazy_loading_enabled && tool_name.as_deref() == Some(SEARCH_TOOL_NAME) {
                let search_result = lazy::build_search_result(&session.state, cfg, &arguments);
                let search_result = intercept::apply_result_compression(
                    &search_result,
                    tool_name.as_deref(),
                    &mut session,
                    cfg,
                );
                session.metrics.search_calls += 1;
                return Some(respond(search_result));
            }

            let mut cache_key = None;
            if intercept::tool_cache_allowed(cfg, tool_name.as_deref()) {
                let key = make_cache_key(
                    &cfg.session_id,
                    &cfg.server_name,
                    tool_name.as_deref().unwrap_or_default(),
                    Some(&arguments),
                );
                if let Some(cached) = session.state.cache_get(&key) {
                    session.metrics.cache_hits += 1;
                    let delivered = intercept::apply_delta_response(
                        &cached,
                        &key,
                        tool_name.as_deref(),
                        &mut session,
                        cfg,
                    );
                    return Some(respond(delivered));
                }
                session.metrics.cache_misses += 1;
                cache_key = Some(key);
            }
            session.pending_insert(
                req_id,
                PendingRequest {
                    method: method.to_string(),
                    tool_name,
                    arguments: Some(arguments),
                    cache_key,
                    ..Default::default()
                },
            );
            None
        }
        _ => {
            session.pending_insert(req_id, PendingRequest::for_method(method));
            None
        }
    }
}

async fn client_to_upstream(
    mut upstream_stdin: ChildStdin,
    session: SharedSession,
    cfg: Arc<ProxyConfig>,
    client_writer: ClientWriter,
    profile_fingerprint: String,
) -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    loop {
        let Some(line) = framing::read_line(&mut reader).await? else {
            tracing::info!(target: "ulmp::proxy", "client EOF, shutting down upstream");
            // Dropping the handle closes the upstream's stdin.
            return Ok(());
        };
        let msg = match line {
            InboundLine::Raw(raw) => {
                framing::write_raw_line(&mut upstream_stdin, &raw).await?;
                continue;
            }
            InboundLine::Message(msg) => msg,
        };

        trace_inbound(cfg.trace_rpc, &msg);

        let method = msg.get("method").and_then(Value::as_str).map(str::to_string);
        let req_id = msg.get("id").cloned().filter(|id| !id.is_null());
        if let (Some(method), Some(req_id)) = (&method, &req_id) {
            if let Some(response) =
                intercept_request(&msg, method, req_id, &session, &cfg, &profile_fingerprint)
            {
                send_to_client(&client_writer, &session, &cfg, response).await?;
                continue;
            }
        }

        {
            let mut session = session.lock();
            session.metrics.upstream_requests += 1;
            session.metrics.upstream_request_bytes += json_size(&msg) as u64;
            session.metrics.upstream_request_tokens += session.token_counter.count(&msg) as u64;
        }
        framing::write_message(&mut upstream_stdin, &msg).await?;
    }
}

/// Post-processes one upstream response under the session lock.
fn intercept_response(
    msg: &mut Value,
    session: &SharedSession,
    cfg: &ProxyConfig,
    profile_fingerprint: &str,
) {
    let mut session = session.lock();

    session.metrics.upstream_responses += 1;
    session.metrics.upstream_response_bytes += json_size(msg) as u64;
    session.metrics.upstream_response_tokens += session.token_counter.count(msg) as u64;

    let Some(req_id) = msg.get("id").cloned().filter(|id| !id.is_null()) else {
        trace_upstream(cfg.trace_rpc, msg, None);
        return;
    };
    trace_upstream(cfg.trace_rpc, msg, session.pending_method(&req_id));

    if msg.get("result").is_some() {
        let Some(pending) = session.pending_remove(&req_id) else {
            return;
        };
        match pending.method.as_str() {
            "initialize" => {
                if cfg.tools_hash_sync_enabled && pending.client_tools_hash_sync_supported {
                    session.tools_hash_negotiated = true;
                    let injected = tools_hash::inject_initialize_capability(
                        &msg["result"],
                        &cfg.tools_hash_sync_algorithm,
                    );
                    msg["result"] = injected;
                } else {
                    session.tools_hash_negotiated = false;
                }
            }
            "tools/list" => {
                let negotiated = session.tools_hash_negotiated;
                let conditional = ToolsListConditional {
                    provided: pending.if_none_match_provided,
                    valid: pending.if_none_match_valid,
                    value: pending.if_none_match.clone(),
                };
                let optimized = handle_tools_list_result(
                    &msg["result"],
                    &mut session,
                    cfg,
                    profile_fingerprint,
                    negotiated,
                    &conditional,
                );
                msg["result"] = optimized;
                if cfg.stats {
                    tracing::info!(
                        target: "ulmp::stats",
                        saved_bytes = session.metrics.tools_list_saved_bytes,
                        "tools/list optimized"
                    );
                }
            }
            "tools/call" => {
                let optimized =
                    handle_tools_call_response(&msg["result"], &pending, &mut session, cfg);
                msg["result"] = optimized;
            }
            _ => {}
        }
    } else if msg.get("error").is_some() {
        // Upstream errors are forwarded verbatim; the cache and delta
        // history are left untouched for that key.
        if let Some(pending) = session.pending_remove(&req_id) {
            if pending.method == "initialize" {
                session.tools_hash_negotiated = false;
            }
        }
    }
}

async fn upstream_to_client(
    upstream_stdout: tokio::process::ChildStdout,
    session: SharedSession,
    cfg: Arc<ProxyConfig>,
    client_writer: ClientWriter,
    profile_fingerprint: String,
) -> Result<()> {
    let mut reader = BufReader::new(upstream_stdout);
    loop {
        let Some(line) = framing::read_line(&mut reader).await? else {
            tracing::info!(target: "ulmp::proxy", "upstream EOF");
            return Ok(());
        };
        match line {
            InboundLine::Raw(raw) => {
                let mut out = client_writer.lock().await;
                framing::write_raw_line(&mut *out, &raw).await?;
            }
            InboundLine::Message(mut msg) => {
                intercept_response(&mut msg, &session, &cfg, &profile_fingerprint);
                send_to_client(&client_writer, &session, &cfg, msg).await?;
            }
        }
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut stderr = stderr;
    let mut sink = tokio::io::stderr();
    let _ = tokio::io::copy(&mut stderr, &mut sink).await;
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Waits for the child, escalating to SIGKILL after `grace`.
async fn wait_with_grace(child: &mut Child, grace: Duration) -> i32 {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => exit_code(status),
        Ok(Err(_)) => 1,
        Err(_) => {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => exit_code(status),
                Err(_) => 1,
            }
        }
    }
}

/// Runs the proxy against the given upstream command. Returns the exit
/// code to propagate to the host.
pub async fn run_proxy(command: Vec<String>, cfg: ProxyConfig) -> Result<i32> {
    let command = resolve_upstream_command(&command);
    let profile_fingerprint = tools_hash::build_profile_fingerprint(&cfg.server_name, &command);

    tracing::info!(target: "ulmp::proxy", command = ?command, "starting upstream server");

    let mut child = match Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(
                target: "ulmp::proxy",
                command = ?command,
                error = %err,
                "failed to spawn upstream server"
            );
            return Ok(1);
        }
    };

    let upstream_stdin = child.stdin.take().expect("child stdin is piped");
    let upstream_stdout = child.stdout.take().expect("child stdout is piped");
    let upstream_stderr = child.stderr.take().expect("child stderr is piped");

    let session: SharedSession = Arc::new(Mutex::new(ProxySession::new(
        cfg.cache_max_entries,
        cfg.result_key_bootstrap_interval,
    )));
    let cfg = Arc::new(cfg);
    let client_writer: ClientWriter = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));

    if cfg.trace_rpc {
        tracing::trace!(target: "ulmp::rpc", "trace-rpc enabled");
    }

    let mut client_task = tokio::spawn(client_to_upstream(
        upstream_stdin,
        Arc::clone(&session),
        Arc::clone(&cfg),
        Arc::clone(&client_writer),
        profile_fingerprint.clone(),
    ));
    let mut upstream_task = tokio::spawn(upstream_to_client(
        upstream_stdout,
        Arc::clone(&session),
        Arc::clone(&cfg),
        Arc::clone(&client_writer),
        profile_fingerprint,
    ));
    let stderr_task = tokio::spawn(forward_stderr(upstream_stderr));

    let code = tokio::select! {
        res = &mut upstream_task => {
            if let Ok(Err(err)) = res {
                tracing::error!(target: "ulmp::proxy", error = %err, "upstream_to_client error");
            }
            wait_with_grace(&mut child, Duration::from_secs(5)).await
        }
        res = &mut client_task => {
            if let Ok(Err(err)) = res {
                tracing::error!(target: "ulmp::proxy", error = %err, "client_to_upstream error");
            }
            // The client loop closed the upstream's stdin on EOF; give the
            // upstream a short grace period before terminating it.
            match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                Ok(Ok(status)) => exit_code(status),
                _ => {
                    signals::terminate_child(&mut child);
                    wait_with_grace(&mut child, Duration::from_secs(2)).await
                }
            }
        }
        _ = signals::shutdown_signal() => {
            signals::terminate_child(&mut child);
            wait_with_grace(&mut child, Duration::from_secs(2)).await
        }
    };

    client_task.abort();
    upstream_task.abort();
    stderr_task.abort();

    if cfg.stats {
        session.lock().metrics.log_summary();
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn resolve_passes_through_paths_and_unknown_names() {
        let with_path = vec!["./server".to_string(), "--flag".to_string()];
        assert_eq!(resolve_upstream_command(&with_path), with_path);

        let unknown = vec!["definitely-not-a-real-binary-name".to_string()];
        assert_eq!(resolve_upstream_command(&unknown), unknown);
    }

    #[test]
    fn resolve_finds_bare_names_on_path() {
        let resolved = resolve_upstream_command(&["sh".to_string(), "-c".to_string()]);
        assert!(Path::new(&resolved[0]).is_absolute(), "expected absolute path, got {resolved:?}");
        assert_eq!(resolved[1], "-c");
    }
}
