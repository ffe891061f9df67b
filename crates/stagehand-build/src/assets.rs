//! Files shipped inside every build context.

use std::io::Write;

use crate::{ArchiveBuilder, ArchiveError};

/// Name of the Dockerfile at the context root.
pub const DOCKERFILE: &str = "Dockerfile";

pub struct Asset {
    pub name: &'static str,
    pub data: &'static [u8],
}

/// Mode recorded for every embedded asset.
pub const ASSET_MODE: u32 = 0o755;

pub const ASSETS: &[Asset] = &[
    Asset {
        name: DOCKERFILE,
        data: include_bytes!("../assets/Dockerfile"),
    },
    Asset {
        name: "staging.sh",
        data: include_bytes!("../assets/staging.sh"),
    },
    Asset {
        name: "launch.sh",
        data: include_bytes!("../assets/launch.sh"),
    },
];

/// Append every embedded asset at the context root.
pub fn add_assets<W: Write>(builder: &mut ArchiveBuilder<W>) -> Result<(), ArchiveError> {
    for asset in ASSETS {
        builder.add_file(asset.data, asset.name, ASSET_MODE)?;
    }
    Ok(())
}
