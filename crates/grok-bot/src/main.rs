use clap::Parser;
use grok_bot::{app, config, logging};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "grok-bot")]
struct Args {
    #[arg(long, env = "GROK_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::load_config(&args.config)?;
    let _log_guard = logging::init_logging(&config.logging, args.debug);
    app::run(config).await
}
