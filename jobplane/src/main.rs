//! # Jobplane Binary
//!
//! Entry point for the jobplane daemon. Parses CLI arguments and starts the
//! overlay node, the dispatch loops and the REST API.
//!
//! ## Usage
//! ```bash
//! jobplane --rest-api-port 8080 --p2p-port 4001 --bootstrap-peer /ip4/<ip>/tcp/<port>/p2p/<peer-id>
//! ```

use clap::Parser;
use jobplane::{Cli, start_jobplane};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let node = start_jobplane(cli).await?;
    if !node.handles.is_empty() {
        let _ = futures::future::join_all(node.handles).await;
    }
    Ok(())
}
