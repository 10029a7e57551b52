use anyhow::Result;
use clap::Parser;

use asp_exchange::command::{self, SweepArgs};

#[tokio::main]
async fn main() -> Result<()> {
    command::init_tracing();
    let args = SweepArgs::parse();
    command::run_sweep(args).await
}
