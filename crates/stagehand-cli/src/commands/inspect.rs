use stagehand_staging::DriverRegistry;

use super::session::{Session, Target};

pub async fn info(target: &Target) -> anyhow::Result<()> {
    let session = Session::open(target)?;
    for package in &session.packages {
        let details = package.info().await?;
        println!("{}", serde_json::to_string_pretty(&details)?);
    }
    Ok(())
}

/// Remove containers and images of every selected application.
pub async fn clean(target: &Target) -> anyhow::Result<()> {
    let session = Session::open(target)?;
    let names: Vec<String> = session
        .packages
        .iter()
        .map(|p| p.name().to_owned())
        .collect();
    session.conclude(true, Ok(())).await?;
    for name in names {
        println!("Removed {name}");
    }
    Ok(())
}

pub fn drivers() -> anyhow::Result<()> {
    for name in DriverRegistry::with_builtin().list() {
        println!("{name}");
    }
    Ok(())
}

pub fn config(target: &Target) -> anyhow::Result<()> {
    let config = target.load_config()?;
    print!("{}", config.render_masked()?);
    Ok(())
}
