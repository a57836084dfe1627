use flow_consumer_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    let exit_code = match run_cli().await {
        Ok(()) => 0,
        Err(e) => {
            error!("CLI error: {}", e);
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };

    // The operator input watcher may still be blocked reading stdin, so the
    // runtime is not allowed to wait for it
    std::process::exit(exit_code);
}
