//! Fault bus shared by a backup run
//!
//! Per-item and per-folder problems are accumulated here instead of aborting
//! the run. The bus distinguishes:
//!
//! - **Recoverable errors** - logged and counted, the run continues
//! - **Failure** - the first hard error; loops check [`FaultBus::failure`] and stop
//! - **Skips** - items deliberately left out (malware, inaccessible OneNote files)
//! - **Alerts** - advisory findings for operators, such as previous-path collisions

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

/// Why an item was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// The service flagged the item as malware
    Malware,
    /// A OneNote export that the service refused to serve
    OneNote,
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malware => write!(f, "malware_detected"),
            Self::OneNote => write!(f, "inaccessible_one_note_file"),
        }
    }
}

/// Whether the skipped entry was a file or a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    File,
    Container,
}

/// A skipped item record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub kind: SkipKind,
    pub cause: SkipCause,
    pub drive_id: String,
    pub item_id: String,
    pub name: String,
}

impl Skipped {
    pub fn file(
        cause: SkipCause,
        drive_id: impl Into<String>,
        item_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: SkipKind::File,
            cause,
            drive_id: drive_id.into(),
            item_id: item_id.into(),
            name: name.into(),
        }
    }

    pub fn container(
        cause: SkipCause,
        drive_id: impl Into<String>,
        item_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: SkipKind::Container,
            ..Self::file(cause, drive_id, item_id, name)
        }
    }
}

/// An advisory finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub message: String,
    pub namespace: String,
    pub item_id: String,
    pub resource: String,
    pub additional: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(
        message: impl Into<String>,
        namespace: impl Into<String>,
        item_id: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            namespace: namespace.into(),
            item_id: item_id.into(),
            resource: resource.into(),
            additional: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct FaultState {
    failure: Option<String>,
    recovered: Vec<String>,
    skipped: Vec<Skipped>,
    alerts: Vec<Alert>,
}

/// Collector for everything that went wrong, or was left out, during a run
#[derive(Debug, Default)]
pub struct FaultBus {
    fail_fast: bool,
    state: Mutex<FaultState>,
}

impl FaultBus {
    /// Creates a bus. With `fail_fast` the first recoverable error also
    /// becomes the failure.
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            state: Mutex::new(FaultState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a hard failure. Only the first failure is kept.
    pub fn fail(&self, err: impl fmt::Display) {
        let message = format!("{err:#}");
        warn!(error = %message, "backup failure");

        let mut state = self.state();
        if state.failure.is_none() {
            state.failure = Some(message);
        }
    }

    /// The first hard failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.state().failure.clone()
    }

    /// Records an error the run can continue past.
    pub fn add_recoverable(&self, err: impl fmt::Display) {
        let message = format!("{err:#}");
        warn!(error = %message, "recoverable error");

        let mut state = self.state();
        if self.fail_fast && state.failure.is_none() {
            state.failure = Some(message.clone());
        }
        state.recovered.push(message);
    }

    pub fn recovered(&self) -> Vec<String> {
        self.state().recovered.clone()
    }

    pub fn add_skip(&self, skip: Skipped) {
        info!(
            drive_id = %skip.drive_id,
            item_id = %skip.item_id,
            skipped_reason = %skip.cause,
            "item skipped"
        );
        self.state().skipped.push(skip);
    }

    pub fn skipped(&self) -> Vec<Skipped> {
        self.state().skipped.clone()
    }

    pub fn add_alert(&self, alert: Alert) {
        warn!(alert = %alert.message, item_id = %alert.item_id, "alert raised");
        self.state().alerts.push(alert);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state().alerts.clone()
    }
}
