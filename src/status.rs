//! Process-wide agent lifecycle status.
//!
//! The control plane receives the current status label with every heartbeat
//! and error upload, so the register has to stay coherent while several loops
//! report progress concurrently.

use std::sync::{Arc, Mutex};

/// Discrete agent lifecycle states. The values are independent flags so that
/// a wire label can be derived from whichever state was recorded last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    ConfigReadFailed = 1,
    ConfigReadSucceeded = 2,
    RegistrationFailed = 4,
    RegistrationSucceeded = 8,
    QueuePollingSucceeded = 16,
    Active = 32,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::ConfigReadFailed => "CONFIG_READ_FAILED",
            Status::ConfigReadSucceeded => "CONFIG_READ_SUCCESS",
            Status::RegistrationFailed => "REGISTRATION_FAILED",
            Status::RegistrationSucceeded => "REGISTRATION_SUCCESS",
            Status::QueuePollingSucceeded => "QUEUE_READ_SUCCESS",
            Status::Active => "ACTIVE",
        }
    }
}

/// Shared register holding the most recent agent status.
#[derive(Clone, Default)]
pub struct StatusRegister {
    current: Arc<Mutex<Option<Status>>>,
}

impl StatusRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new status. `Active` is the terminal liveness indicator and
    /// is not downgraded by a routine polling success.
    pub fn update(&self, new: Status) {
        let mut current = self.current.lock().expect("status register poisoned");
        if !(*current == Some(Status::Active) && new == Status::QueuePollingSucceeded) {
            *current = Some(new);
        }
    }

    pub fn current(&self) -> Option<Status> {
        *self.current.lock().expect("status register poisoned")
    }

    /// Wire label of the current status; empty before the first update.
    pub fn label(&self) -> String {
        self.current().map(|s| s.label().to_string()).unwrap_or_default()
    }
}
