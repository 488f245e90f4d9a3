/// Holding pen CLI
///
/// Administrative commands for the holding pen: migrations, inspecting
/// workflow objects and answering curator halts from the terminal.

use holdingpen_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
