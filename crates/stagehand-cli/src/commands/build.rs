use stagehand_staging::AppPackage;
use tokio_util::sync::CancellationToken;

use super::session::{Session, Target};

pub async fn build(target: &Target, cancel: &CancellationToken, cleanup: bool) -> anyhow::Result<()> {
    let mut session = Session::open(target)?;
    let result = build_all(&mut session.packages, cancel).await;
    session.conclude(cleanup, result).await
}

pub async fn stage(target: &Target, cancel: &CancellationToken, cleanup: bool) -> anyhow::Result<()> {
    let mut session = Session::open(target)?;
    let result = stage_all(&mut session.packages, cancel).await;
    session.conclude(cleanup, result).await
}

async fn build_all(
    packages: &mut [Box<dyn AppPackage>],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    for package in packages.iter_mut() {
        let id = package.build(cancel).await?;
        println!("Built {} ({id})", package.name());
    }
    Ok(())
}

async fn stage_all(
    packages: &mut [Box<dyn AppPackage>],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    for package in packages.iter_mut() {
        package.build(cancel).await?;
        package.push(cancel).await?;
        println!("Pushed {}", package.image());
    }
    Ok(())
}
