//! `ultra-lean-mcp-proxy` binary; everything real lives in `ulmp-server`.

fn main() -> anyhow::Result<()> {
    ulmp_server::run()
}
