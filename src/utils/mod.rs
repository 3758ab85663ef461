//! Utility Functions
//!
//! Logging setup shared by hosts embedding the file transfer engine:
//!
//! ```no_run
//! use lamco_cliprdr_files::config::Config;
//! use lamco_cliprdr_files::utils::init_logging;
//!
//! let config = Config::load("/etc/lamco/cliprdr-files.toml")?;
//! init_logging(&config.logging)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod logging;

pub use logging::{init_logging, AUDIT_TARGET};
