use anyhow::Result;
use tracing::error;

mod browser;
mod cli;
mod error;
mod nodes;
mod recovery;
mod storage;
mod utils;
mod workflow;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    utils::init_logging(args.verbose(), args.log_file())?;

    match cli::process_command(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
