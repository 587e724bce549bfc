//! # incr-backup
//!
//! Incremental, content-addressed backups of large directory trees.
//!
//! ## Features
//!
//! - **Change Detection**: BLAKE3 fingerprints per top-level folder, compared with the
//!   last successful run
//! - **Compression**: XZ (LZMA) with parallel processing, with already-compressed media
//!   stored verbatim
//! - **Strategies**: one container per changed folder, or parallel split-merge into a
//!   single container
//! - **Crash Safety**: containers and metadata are replaced atomically, failed folders
//!   are retried on the next run
//!
//! ## Quick Start
//!
//! ```no_run
//! use incr_backup::backup::backup_config::BackupConfig;
//! use incr_backup::backup::cancel::CancelToken;
//! use incr_backup::backup::observer::TracingObserver;
//! use incr_backup::backup::pipeline::BackupPipeline;
//!
//! // Load configuration from YAML file
//! let config = BackupConfig::load("config.yml")?;
//!
//! // Back up everything that changed since the last run
//! let pipeline = BackupPipeline::new(
//!     config,
//!     std::sync::Arc::new(TracingObserver),
//!     CancelToken::new(),
//! )?;
//! let summary = pipeline.run()?;
//! println!("{summary}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
