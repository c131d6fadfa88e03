use clap::{CommandFactory, Parser};
use reanalysis_processor::cli::{args::Args, commands};
use std::process;
use tokio_util::sync::CancellationToken;

fn main() {
    let args = Args::parse();

    // Without a subcommand there is nothing to run
    if args.command.is_none() {
        let _ = Args::command().print_help();
        process::exit(0);
    }

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create async runtime: {}", e);
        process::exit(1);
    });

    let result = runtime.block_on(async {
        let cancellation_token = CancellationToken::new();

        let shutdown_signal = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("Failed to install CTRL+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        // The command keeps running after CTRL+C until its units have cleaned up
        commands::run_until_shutdown(
            commands::run(args, cancellation_token.clone()),
            shutdown_signal,
            &cancellation_token,
        )
        .await
    });

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}
