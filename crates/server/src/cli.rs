use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Lazy tool-visibility mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LazyModeArg {
    /// No lazy loading.
    Off,
    /// Stripped schemas keeping property names and types.
    Minimal,
    /// Bare name stubs plus a name list in the search tool.
    Catalog,
    /// Ship only the search meta-tool.
    #[value(name = "search_only")]
    SearchOnly,
}

impl LazyModeArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Catalog => "catalog",
            Self::SearchOnly => "search_only",
        }
    }
}

/// Result-compression mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ResultCompressionModeArg {
    /// Compression forced off.
    Off,
    /// Alias keys appearing at least twice.
    Balanced,
    /// Alias every eligible key.
    Aggressive,
}

impl ResultCompressionModeArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

/// Command-line interface for the `ultra-lean-mcp-proxy` application.
#[derive(Debug, Parser)]
#[command(
    name = "ultra-lean-mcp-proxy",
    about = "Transparent MCP proxy that shrinks tools/list and tools/call traffic"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Runs as a transparent MCP proxy in front of an upstream stdio server.
    Proxy(ProxyArgs),
}

/// Arguments for the `proxy` subcommand.
#[derive(Debug, Args)]
pub struct ProxyArgs {
    /// Logs optimization statistics to stderr and attaches runtime metrics to results.
    #[arg(long)]
    pub stats: bool,
    /// Traces every JSON-RPC message to stderr.
    #[arg(long)]
    pub trace_rpc: bool,
    /// Enables debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the proxy config file (JSON).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Session id for cache/delta state.
    #[arg(long, value_name = "STRING")]
    pub session_id: Option<String>,
    /// Rejects config documents containing unknown top-level sections.
    #[arg(long)]
    pub strict_config: bool,
    /// Prints the resolved config to stderr before starting.
    #[arg(long)]
    pub dump_effective_config: bool,

    /// Enable result compression.
    #[arg(long, overrides_with = "disable_result_compression")]
    pub enable_result_compression: bool,
    /// Disable result compression.
    #[arg(long)]
    pub disable_result_compression: bool,
    /// Enable delta responses.
    #[arg(long, overrides_with = "disable_delta_responses")]
    pub enable_delta_responses: bool,
    /// Disable delta responses.
    #[arg(long)]
    pub disable_delta_responses: bool,
    /// Enable lazy tool loading.
    #[arg(long, overrides_with = "disable_lazy_loading")]
    pub enable_lazy_loading: bool,
    /// Disable lazy tool loading.
    #[arg(long)]
    pub disable_lazy_loading: bool,
    /// Enable tools-hash synchronization.
    #[arg(long, overrides_with = "disable_tools_hash_sync")]
    pub enable_tools_hash_sync: bool,
    /// Disable tools-hash synchronization.
    #[arg(long)]
    pub disable_tools_hash_sync: bool,
    /// Enable tool-call response caching.
    #[arg(long, overrides_with = "disable_caching")]
    pub enable_caching: bool,
    /// Disable tool-call response caching.
    #[arg(long)]
    pub disable_caching: bool,

    /// Default cache TTL in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub cache_ttl: Option<u64>,
    /// Minimum savings ratio for delta emission.
    #[arg(long, value_name = "RATIO")]
    pub delta_min_savings: Option<f64>,
    /// Lazy loading mode.
    #[arg(long, value_enum)]
    pub lazy_mode: Option<LazyModeArg>,
    /// Force a full tools snapshot every N conditional hits.
    #[arg(long, value_name = "INT")]
    pub tools_hash_refresh_interval: Option<u64>,
    /// Default top-k for the search meta-tool.
    #[arg(long, value_name = "INT")]
    pub search_top_k: Option<usize>,
    /// Result compression mode.
    #[arg(long, value_enum)]
    pub result_compression_mode: Option<ResultCompressionModeArg>,

    /// Upstream MCP server command (everything after `--`).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub upstream: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_args_parse_with_upstream_after_separator() {
        let cli = Cli::parse_from([
            "ultra-lean-mcp-proxy",
            "proxy",
            "--stats",
            "--lazy-mode",
            "minimal",
            "--cache-ttl",
            "120",
            "--",
            "npx",
            "@modelcontextprotocol/server-filesystem",
            "/tmp",
        ]);
        let Commands::Proxy(args) = cli.command;
        assert!(args.stats);
        assert_eq!(args.cache_ttl, Some(120));
        assert!(matches!(args.lazy_mode, Some(LazyModeArg::Minimal)));
        assert_eq!(
            args.upstream,
            vec!["npx", "@modelcontextprotocol/server-filesystem", "/tmp"]
        );
    }

    #[test]
    fn enable_and_disable_toggles_coexist() {
        let cli = Cli::parse_from([
            "ultra-lean-mcp-proxy",
            "proxy",
            "--enable-caching",
            "--disable-delta-responses",
            "--",
            "server",
        ]);
        let Commands::Proxy(args) = cli.command;
        assert!(args.enable_caching);
        assert!(!args.disable_caching);
        assert!(args.disable_delta_responses);
    }
}
