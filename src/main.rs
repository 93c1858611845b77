use clap::Parser;

use vocu_tts::cli::Cli;
use vocu_tts::{cli, config, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let (config, config_path) = match config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging, cli.verbose) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = cli::run(cli.command, &config, &config_path).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
