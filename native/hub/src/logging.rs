use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rinf::{DartSignal, RustSignal};
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    time,
};
use tracing::{Event, Instrument, Subscriber, error, info_span};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::models::signals::logging::{
    GetLogsDirectoryRequest, GetLogsDirectoryResponse, LogBatch, LogEntry, LogLevel,
};

const CHANNEL_CAPACITY: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BATCH_LEN: usize = 10;

/// A tracing layer that forwards log events to Flutter via Rinf signals
pub struct SignalLayer {
    sender: Sender<LogEntry>,
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Errors go out immediately, everything else waits for a full batch or the next tick
fn should_flush(buffer: &[LogEntry]) -> bool {
    buffer.len() >= MAX_BATCH_LEN || buffer.last().is_some_and(|e| e.level == LogLevel::Error)
}

impl SignalLayer {
    pub fn new() -> (Self, Receiver<LogEntry>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Start the background task that batches and sends log entries to Flutter
    pub fn start_forwarder(mut receiver: Receiver<LogEntry>) {
        tokio::spawn(
            async move {
                let mut buffer = Vec::new();
                let mut interval = time::interval(FLUSH_INTERVAL);

                loop {
                    tokio::select! {
                        maybe_entry = receiver.recv() => {
                            let Some(entry) = maybe_entry else {
                                error!("Log entry channel closed unexpectedly");
                                break;
                            };
                            buffer.push(entry);
                            if should_flush(&buffer) {
                                Self::flush_buffer(&mut buffer);
                            }
                        }
                        _ = interval.tick() => Self::flush_buffer(&mut buffer),
                    }
                }
            }
            .instrument(info_span!("task_log_forwarder")),
        );
    }

    pub fn start_request_handler(logs_dir: PathBuf) {
        tokio::spawn(
            async move {
                let directory_receiver = GetLogsDirectoryRequest::get_dart_signal_receiver();
                while directory_receiver.recv().await.is_some() {
                    GetLogsDirectoryResponse { path: logs_dir.to_string_lossy().to_string() }
                        .send_signal_to_dart();
                }
                error!("Log directory request channel closed unexpectedly");
            }
            .instrument(info_span!("task_log_request_handler")),
        );
    }

    fn flush_buffer(buffer: &mut Vec<LogEntry>) {
        if !buffer.is_empty() {
            LogBatch { entries: std::mem::take(buffer) }.send_signal_to_dart();
        }
    }
}

impl<S> Layer<S> for SignalLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let spans = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name().to_string()).collect())
            .unwrap_or_default();

        let fields = visitor.fields;
        let entry = LogEntry {
            timestamp: current_timestamp_ms(),
            level: LogLevel::from(*event.metadata().level()),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: if fields.is_empty() { None } else { Some(fields) },
            spans,
        };

        // Dropped when the channel is full
        let _ = self.sender.try_send(entry);
    }
}

/// Visitor to extract fields from tracing events
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        let mut text = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            text.push_str(&format!(": {cause}"));
            source = cause.source();
        }
        self.fields.insert(field.name().to_string(), text);
    }
}
