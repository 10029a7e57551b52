use anyhow::Result;
use clap::Parser;

use asp_exchange::command::{self, TransferArgs};
use asp_exchange::model::ItemKind;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Exchange employee records (typeMouvement C) with ASP over SFTP"
)]
struct Cli {
    #[command(flatten)]
    transfer: TransferArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    command::init_tracing();
    let cli = Cli::parse();
    command::run_transfer(ItemKind::Record, cli.transfer).await
}
