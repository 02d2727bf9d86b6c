use std::collections::BTreeMap;

use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, SignalPiece)]
pub struct LogEntry {
    pub timestamp: u64, // Milliseconds since Unix epoch
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub fields: Option<BTreeMap<String, String>>,
    /// Names of the enclosing spans, outermost first
    pub spans: Vec<String>,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct LogBatch {
    pub entries: Vec<LogEntry>,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct GetLogsDirectoryRequest {}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct GetLogsDirectoryResponse {
    pub path: String,
}
