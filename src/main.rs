use clap::Parser;
use color_eyre::eyre::Result;
use tiny_adventure::{
    client,
    config::Args,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    client::init_tracing(args.action);
    tracing::info!("starting tiny-adventure client");
    let config = args.resolve()?;
    client::run_app(config).await
}
