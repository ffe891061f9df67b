mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use stagehand_staging::{ErrorClass, StagingError};
use tokio_util::sync::CancellationToken;

use commands::{Target, UsageError};

#[derive(Parser)]
#[command(name = "stagehand", about = "Stage applications into container images with buildpacks")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image for each application
    Build {
        /// Remove containers and images when done
        #[arg(long)]
        cleanup: bool,
    },
    /// Build and push each application's image
    Stage {
        /// Remove containers and images when done
        #[arg(long)]
        cleanup: bool,
    },
    /// Build and run each application
    Run {
        /// Environment variable passed to the container (KEY=VALUE)
        #[arg(long = "env", short = 'e', value_parser = commands::parse_env)]
        env: Vec<(String, String)>,
        /// Host directory mounted as the persistent data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Do not stream container output
        #[arg(long)]
        detach_output: bool,
        /// Remove containers and images when done
        #[arg(long)]
        cleanup: bool,
    },
    /// Show details of each application's built image
    Info,
    /// Remove containers and images left by earlier runs
    Clean,
    /// List the available staging drivers
    Drivers,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Commands::Build { cleanup } => commands::build(&cli.target, &cancel, cleanup).await,
        Commands::Stage { cleanup } => commands::stage(&cli.target, &cancel, cleanup).await,
        Commands::Run {
            env,
            data_dir,
            detach_output,
            cleanup,
        } => {
            let options = commands::RunOptions {
                env: env.into_iter().collect(),
                data_dir,
                follow_output: !detach_output,
                cleanup,
            };
            commands::run(&cli.target, &cancel, &options).await
        }
        Commands::Info => commands::info(&cli.target).await,
        Commands::Clean => commands::clean(&cli.target).await,
        Commands::Drivers => commands::drivers(),
        Commands::Config => commands::config(&cli.target),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}

/// 2 for configuration or usage mistakes, 3 when the engine is unreachable, 1 otherwise.
fn exit_status(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(staging) = cause.downcast_ref::<StagingError>() {
            return match staging.class() {
                ErrorClass::Configuration => 2,
                ErrorClass::Engine => 3,
                ErrorClass::Failure => 1,
            };
        }
        if cause.is::<stagehand_core::Error>() || cause.is::<UsageError>() {
            return 2;
        }
    }
    1
}
