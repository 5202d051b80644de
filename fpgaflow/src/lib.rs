pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod report;
pub mod run;

pub use config::{BuildConfig, BuildMode, Config};
pub use driver::{Driver, DriverBuilder, Request, TargetKind};
pub use error::{Error, Result};
pub use run::{Env, Invocation, Run, StageStatus};
