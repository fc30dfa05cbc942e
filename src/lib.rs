pub mod cli;
pub mod config;
pub mod diff;
pub mod download;
pub mod fsutil;
pub mod hasher;
pub mod installer;
pub mod logging;
pub mod package;
pub mod progress;

pub use diff::{compute_plan, DiffOptions, FileEntry, UpdatePlan};
pub use installer::{InstallError, PackageInstaller};
pub use progress::{
    BarProgressHandler, LogProgressHandler, ProgressHandler, ProgressReporter, ProgressSender,
};
