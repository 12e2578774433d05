//! Hidden host subcommand: serve fetch RPC on stdio for isolated workers.

use anyhow::Result;

use reposync_core::child::{serve_stdio, FetchService};

pub fn run_fetch_host() -> Result<()> {
    tracing::debug!("fetch host serving on stdio");
    serve_stdio::<FetchService>()
}
