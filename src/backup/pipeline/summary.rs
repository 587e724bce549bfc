use crate::backup::result_error::error::Error;
use chrono::{DateTime, Utc};
use getset::Getters;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct UnitFailure {
    unit: String,
    message: String,
}

/// What a run did to each unit, reported once the run is over.
#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct BackupSummary {
    started_at: DateTime<Utc>,
    elapsed: Duration,
    backed_up: Vec<String>,
    up_to_date: Vec<String>,
    skipped_empty: Vec<String>,
    failed: Vec<UnitFailure>,
    /// Containers written during the run.
    archives: Vec<PathBuf>,
}

impl BackupSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            elapsed: Duration::ZERO,
            backed_up: Vec::new(),
            up_to_date: Vec::new(),
            skipped_empty: Vec::new(),
            failed: Vec::new(),
            archives: Vec::new(),
        }
    }

    pub(crate) fn record_backed_up(&mut self, unit: &str) {
        self.backed_up.push(unit.to_string());
    }

    pub(crate) fn record_up_to_date(&mut self, unit: &str) {
        self.up_to_date.push(unit.to_string());
    }

    pub(crate) fn record_skipped_empty(&mut self, unit: &str) {
        self.skipped_empty.push(unit.to_string());
    }

    pub(crate) fn record_failed(&mut self, unit: &str, error: &Error) {
        self.failed.push(UnitFailure {
            unit: unit.to_string(),
            message: error.to_string(),
        });
    }

    pub(crate) fn record_archive(&mut self, path: PathBuf) {
        self.archives.push(path);
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_failed(&self, unit: &str) -> bool {
        self.failed.iter().any(|f| f.unit == unit)
    }
}

impl Display for BackupSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Backup started {} finished in {:.2?}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.elapsed
        )?;
        writeln!(f, "  backed up: {}", self.backed_up.join(", "))?;
        writeln!(f, "  up to date: {}", self.up_to_date.join(", "))?;
        writeln!(f, "  skipped (empty): {}", self.skipped_empty.join(", "))?;
        write!(f, "  failed: {}", self.failed.len())?;
        for failure in &self.failed {
            write!(
                f,
                "\n    {}:\n{}",
                failure.unit,
                indent::indent_all_with("      ", &failure.message)
            )?;
        }
        Ok(())
    }
}
