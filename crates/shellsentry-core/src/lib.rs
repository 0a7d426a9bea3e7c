pub mod build_scan;
pub mod catalog;
pub mod config;
pub mod report;
pub mod scanner;
pub mod types;

pub use build_scan::find_build_scan_url;
pub use catalog::{default_issues, CatalogError, IssueCatalog};
pub use config::{Config, ConfigError};
pub use report::{CiContext, FailureReport, ReleaseStage};
pub use scanner::{classify, classify_reversed, scan_log_file, LogScan};
pub use types::*;
