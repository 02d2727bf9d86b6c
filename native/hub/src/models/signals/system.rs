use std::time::Duration;

use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};

/// How long a notification stays visible unless a caller picks otherwise
pub const DEFAULT_NOTIFICATION_DURATION: Duration = Duration::from_millis(8000);

#[derive(Serialize, Deserialize, RustSignal)]
pub struct RustPanic {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RustSignal)]
pub struct Notification {
    pub message: String,
    pub kind: NotificationKind,
    /// Display duration in milliseconds, `None` keeps it visible until dismissed
    pub duration: Option<u32>,
}

impl Notification {
    /// A notification that hides itself after [`DEFAULT_NOTIFICATION_DURATION`]
    pub fn transient(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            duration: Some(DEFAULT_NOTIFICATION_DURATION.as_millis() as u32),
        }
    }

    /// A notification that requires the user to dismiss it
    pub fn persistent(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind, duration: None }
    }

    pub fn is_persistent(&self) -> bool {
        self.duration.is_none()
    }
}

/// Asks the user to confirm a destructive action
#[derive(Serialize, Deserialize, RustSignal)]
pub struct ConfirmationRequested {
    /// Correlates the answer with this request
    pub key: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct ConfirmationResponse {
    pub key: String,
    pub accepted: bool,
}
