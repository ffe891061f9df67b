//! Build-context packaging for stagehand.
//!
//! # Context layout
//!
//! ```text
//! <context root>
//!   Dockerfile        embedded, consumes the fixed staging build args
//!   staging.sh        embedded, runs buildpacks and emits staging markers
//!   launch.sh         embedded, container entrypoint
//!   app/...           application source (or a single file plus its manifest)
//!   buildpacks/...    optional pre-fetched buildpack cache
//! ```
//!
//! [`ArchiveBuilder`] assembles the context as a tar stream; [`Filters`]
//! restrict what a directory walk records and every walk honours a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod archive;
pub mod assets;

pub use archive::{ArchiveBuilder, ArchiveError, Filters, unpack};
pub use assets::{ASSETS, Asset, DOCKERFILE, add_assets};
