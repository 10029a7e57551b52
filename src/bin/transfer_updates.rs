use anyhow::Result;
use clap::Parser;

use asp_exchange::command::{self, TransferArgs};
use asp_exchange::model::ItemKind;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Exchange employee record update notifications (typeMouvement M) with ASP over SFTP"
)]
struct Cli {
    #[command(flatten)]
    transfer: TransferArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    command::init_tracing();
    let cli = Cli::parse();
    command::run_transfer(ItemKind::Notification, cli.transfer).await
}
