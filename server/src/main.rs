use anyhow::Result;
use clap::Parser;

use wsi_overlay::serve::{self, ServeArgs};

fn main() -> Result<()> {
    let args = ServeArgs::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    serve::run(args)
}
