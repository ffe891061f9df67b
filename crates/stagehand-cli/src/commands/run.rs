use std::collections::BTreeMap;
use std::path::PathBuf;

use stagehand_staging::RunOutcome;
use tokio_util::sync::CancellationToken;

use super::session::{Session, Target};

pub struct RunOptions {
    pub env: BTreeMap<String, String>,
    pub data_dir: Option<PathBuf>,
    pub follow_output: bool,
    pub cleanup: bool,
}

/// Parse a `KEY=VALUE` pair; the value may be empty or contain `=`.
pub fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

pub async fn run(
    target: &Target,
    cancel: &CancellationToken,
    options: &RunOptions,
) -> anyhow::Result<()> {
    let mut session = Session::open(target)?;
    let result = run_all(&mut session, cancel, options).await;
    session.conclude(options.cleanup, result).await
}

async fn run_all(
    session: &mut Session,
    cancel: &CancellationToken,
    options: &RunOptions,
) -> anyhow::Result<()> {
    for package in session.packages.iter_mut() {
        package.build(cancel).await?;
        let outcome = package
            .run(
                cancel,
                options.data_dir.as_deref(),
                &options.env,
                options.follow_output,
            )
            .await?;
        match outcome {
            RunOutcome::Exited(code) => println!("{} exited with status {code}", package.name()),
            RunOutcome::Cancelled => {
                println!("{} stopped", package.name());
                break;
            }
        }
    }
    Ok(())
}
