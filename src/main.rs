use std::sync::Arc;

use tokenkeeper::config::{load_config, print_schema};
use tokenkeeper::startup::{self, parse_command, USAGE};
use tokenkeeper::utils::logger::init_logging;
use tracing::error;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--schema") {
        print_schema();
        return;
    }

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config = Arc::new(load_config());
    init_logging(&config.logging);

    if let Err(e) = startup::run(config, command).await {
        error!("tokenkeeper stopped with an error: {}", e);
        std::process::exit(1);
    }
}
