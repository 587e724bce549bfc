//! Progress notifications emitted by the pipeline.
//!
//! The pipeline only talks to [`ProgressObserver`]; how progress is rendered is up to
//! the caller. Observers are called from worker threads as well as the orchestrator.

use crate::backup::result_error::error::Error;
use crate::backup::unit::UnitState;
use std::sync::mpsc::Sender;

pub trait ProgressObserver: Send + Sync {
    fn on_unit_started(&self, _unit: &str, _files: usize) {}

    fn on_file_processed(&self, _unit: &str, _entry: &str) {}

    /// Called once per unit that reached a non-failed terminal state.
    fn on_unit_completed(&self, _unit: &str, _state: UnitState) {}

    fn on_unit_failed(&self, _unit: &str, _error: &Error) {}

    /// Called for units with nothing to back up.
    fn on_unit_skipped(&self, _unit: &str) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_unit_started(&self, unit: &str, files: usize) {
        tracing::info!("Checking {unit} ({files} files)");
    }

    fn on_file_processed(&self, unit: &str, entry: &str) {
        tracing::debug!("[{unit}] archived {entry}");
    }

    fn on_unit_completed(&self, unit: &str, state: UnitState) {
        tracing::info!("{unit} -> {state}");
    }

    fn on_unit_failed(&self, unit: &str, error: &Error) {
        tracing::warn!("{unit} failed: {error}");
    }

    fn on_unit_skipped(&self, unit: &str) {
        tracing::info!("{unit} is empty, skipped");
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    UnitStarted { unit: String, files: usize },
    FileProcessed { unit: String, entry: String },
    UnitCompleted { unit: String, state: UnitState },
    UnitFailed { unit: String, message: String },
    UnitSkipped { unit: String },
}

/// Forwards events into an unbounded channel.
///
/// Sending never blocks, however slowly the receiver drains. Events are dropped
/// silently once the receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelObserver {
    tx: Sender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Progress receiver dropped");
        }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_unit_started(&self, unit: &str, files: usize) {
        self.send(ProgressEvent::UnitStarted {
            unit: unit.into(),
            files,
        });
    }

    fn on_file_processed(&self, unit: &str, entry: &str) {
        self.send(ProgressEvent::FileProcessed {
            unit: unit.into(),
            entry: entry.into(),
        });
    }

    fn on_unit_completed(&self, unit: &str, state: UnitState) {
        self.send(ProgressEvent::UnitCompleted {
            unit: unit.into(),
            state,
        });
    }

    fn on_unit_failed(&self, unit: &str, error: &Error) {
        self.send(ProgressEvent::UnitFailed {
            unit: unit.into(),
            message: error.to_string(),
        });
    }

    fn on_unit_skipped(&self, unit: &str) {
        self.send(ProgressEvent::UnitSkipped { unit: unit.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_channel_observer_forwards_events() {
        let (tx, rx) = channel();
        let observer = ChannelObserver::new(tx);
        observer.on_unit_started("game", 2);
        observer.on_file_processed("game", "game/a.txt");
        observer.on_unit_completed("game", UnitState::MetadataUpdated);
        observer.on_unit_failed("other", &Error::Cancelled);
        observer.on_unit_skipped("empty");
        drop(observer);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            ProgressEvent::UnitStarted {
                unit: "game".into(),
                files: 2
            }
        );
        assert!(matches!(&events[3], ProgressEvent::UnitFailed { unit, .. } if unit == "other"));
        assert_eq!(
            events[4],
            ProgressEvent::UnitSkipped {
                unit: "empty".into()
            }
        );
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = channel();
        drop(rx);
        let observer = ChannelObserver::new(tx);
        observer.on_unit_completed("game", UnitState::UpToDate);
    }
}
