//! CLI dispatch and process entry point.

use crate::cli::{Cli, Commands, ProxyArgs};
use crate::config::{load_proxy_config, CliOverrides};
use crate::proxy::run_proxy;
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::str::FromStr;
use ulmp_core::CompressionMode;

/// The main entry point for the `ultra-lean-mcp-proxy` application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Proxy(args) => run_proxy_command(args),
    }
}

fn init_tracing(verbose: bool, trace_rpc: bool) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    if trace_rpc {
        filter = filter.add_directive(
            "ulmp::rpc=trace"
                .parse()
                .context("failed to parse rpc trace directive")?,
        );
    }
    // Stdout carries the JSON-RPC stream; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// A pair of `--enable-X`/`--disable-X` flags folded into one override.
fn toggle(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn run_proxy_command(args: ProxyArgs) -> Result<()> {
    init_tracing(args.verbose, args.trace_rpc)?;

    let mut upstream = args.upstream.clone();
    if upstream.first().map(String::as_str) == Some("--") {
        upstream.remove(0);
    }
    if upstream.is_empty() {
        eprintln!("Error: No upstream server command provided.");
        eprintln!("Usage: ultra-lean-mcp-proxy proxy -- <command> [args...]");
        eprintln!(
            "Example: ultra-lean-mcp-proxy proxy -- npx @modelcontextprotocol/server-filesystem /tmp"
        );
        std::process::exit(1);
    }

    let cli_overrides = CliOverrides {
        stats: args.stats.then_some(true),
        verbose: args.verbose.then_some(true),
        trace_rpc: args.trace_rpc.then_some(true),
        session_id: args.session_id.clone(),
        strict_config: args.strict_config.then_some(true),
        result_compression: toggle(args.enable_result_compression, args.disable_result_compression),
        delta_responses: toggle(args.enable_delta_responses, args.disable_delta_responses),
        lazy_loading: toggle(args.enable_lazy_loading, args.disable_lazy_loading),
        tools_hash_sync: toggle(args.enable_tools_hash_sync, args.disable_tools_hash_sync),
        caching: toggle(args.enable_caching, args.disable_caching),
        cache_ttl: args.cache_ttl,
        delta_min_savings: args.delta_min_savings,
        lazy_mode: args
            .lazy_mode
            .map(|mode| crate::config::LazyMode::from_str(mode.as_str()))
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?,
        tools_hash_refresh_interval: args.tools_hash_refresh_interval,
        search_top_k: args.search_top_k,
        result_compression_mode: args
            .result_compression_mode
            .map(|mode| CompressionMode::from_str(mode.as_str()))
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?,
        config_path: args.config.clone(),
    };

    let env: HashMap<String, String> = std::env::vars().collect();
    let cfg = load_proxy_config(&upstream, args.config.as_deref(), &cli_overrides, &env)?;

    if args.dump_effective_config {
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&cfg).context("failed to serialize effective config")?
        );
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    let code = runtime.block_on(run_proxy(upstream, cfg))?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_resolves_enable_disable_pairs() {
        assert_eq!(toggle(false, false), None);
        assert_eq!(toggle(true, false), Some(true));
        assert_eq!(toggle(false, true), Some(false));
        assert_eq!(toggle(true, true), Some(true));
    }
}
