//! run-isolated - Content-addressed sandbox runner
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use run_isolated::cli::{commands, Cli, Commands};
use run_isolated::config::ConfigManager;
use run_isolated::error::IsolateResult;
use run_isolated::ui::UiContext;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> IsolateResult<u8> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; stdout belongs to the sandboxed command
    let filter = match cli.verbose {
        0 => EnvFilter::new("run_isolated=warn"),
        1 => EnvFilter::new("run_isolated=info"),
        _ => EnvFilter::new("run_isolated=debug"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Loaded configuration from {}", config_manager.path().display());

    let ctx = UiContext::detect().with_quiet(cli.quiet);

    match cli.command {
        Commands::Completions { shell } => {
            commands::completions(shell);
            Ok(0)
        }
        Commands::Run(args) => commands::run(args, &config, &ctx, interrupted()).await,
        Commands::Cache(args) => commands::cache(args, &config, &ctx).await.map(|()| 0),
        Commands::Store(args) => commands::store(args, &config).await.map(|()| 0),
        Commands::Config(args) => commands::config(args, &config_manager, &config, &ctx)
            .await
            .map(|()| 0),
    }
}

/// Resolves on the first Ctrl-C. The handler is installed right away so a
/// signal arriving during sandbox construction is not lost.
fn interrupted() -> impl std::future::Future<Output = ()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(());
        }
    });
    async move {
        if rx.await.is_err() {
            // No handler could be installed; never cancel
            std::future::pending::<()>().await;
        }
    }
}
