mod build;
mod inspect;
mod run;
mod session;

pub use build::{build, stage};
pub use inspect::{clean, config, drivers, info};
pub use run::{RunOptions, parse_env, run};
pub use session::{Target, UsageError};
