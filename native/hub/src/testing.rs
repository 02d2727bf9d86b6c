//! Scripted device and recording observer for tests

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    adb::transport::{Session, Transport, UploadSink},
    error::ProvisionError,
    models::signals::{
        provision::{TransferProgress, UiState},
        system::Notification,
    },
    provision::{ConfirmPrompt, ProvisionObserver},
};

struct Rule {
    prefix: String,
    responses: VecDeque<Result<String, String>>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct DeviceState {
    rules: Vec<Rule>,
    commands: Vec<String>,
    upload_chunks: Vec<Vec<u8>>,
    fail_upload_at: Option<usize>,
    connect_error: Option<ProvisionError>,
    current_token: Option<CancellationToken>,
    sessions_opened: usize,
    closes: usize,
}

/// Fake device: answers commands by prefix (the most recently registered match wins),
/// records everything it receives and can be "unplugged".
#[derive(Clone, Default)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, prefix: &str, responses: Vec<Result<String, String>>, delay: Option<Duration>) {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            responses: responses.into(),
            delay,
        });
    }

    pub fn respond(&self, prefix: &str, output: &str) {
        self.add_rule(prefix, vec![Ok(output.to_string())], None);
    }

    /// Answers with each output in turn, then keeps repeating the last one
    pub fn respond_sequence(&self, prefix: &str, outputs: &[&str]) {
        self.add_rule(prefix, outputs.iter().map(|o| Ok(o.to_string())).collect(), None);
    }

    pub fn respond_after(&self, prefix: &str, output: &str, delay: Duration) {
        self.add_rule(prefix, vec![Ok(output.to_string())], Some(delay));
    }

    pub fn fail(&self, prefix: &str, message: &str) {
        self.add_rule(prefix, vec![Err(message.to_string())], None);
    }

    /// Fails the n-th (1-based) upload chunk write
    pub fn fail_upload_at_chunk(&self, chunk: usize) {
        self.state.lock().unwrap().fail_upload_at = Some(chunk);
    }

    pub fn fail_connect(&self, error: ProvisionError) {
        self.state.lock().unwrap().connect_error = Some(error);
    }

    /// Simulates the cable being pulled from the current session
    pub fn unplug(&self) {
        if let Some(token) = self.state.lock().unwrap().current_token.clone() {
            token.cancel();
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn upload_chunk_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().upload_chunks.iter().map(Vec::len).collect()
    }

    pub fn uploaded_bytes(&self) -> Vec<u8> {
        self.state.lock().unwrap().upload_chunks.concat()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Opens a new session with a fresh disconnect token
    pub fn session(&self) -> Arc<dyn Session> {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock().unwrap();
            state.current_token = Some(token.clone());
            state.sessions_opened += 1;
        }
        Arc::new(FakeSession { device: self.clone(), token })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport { device: self.clone() })
    }

    fn answer(&self, command: &str) -> (Result<String, String>, Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        let Some(rule) = state.rules.iter_mut().rev().find(|r| command.starts_with(&r.prefix))
        else {
            return (Ok(String::new()), None);
        };
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        (response.unwrap_or_else(|| Ok(String::new())), rule.delay)
    }
}

struct FakeTransport {
    device: FakeDevice,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, ProvisionError> {
        if let Some(error) = self.device.state.lock().unwrap().connect_error.clone() {
            return Err(error);
        }
        Ok(self.device.session())
    }
}

struct FakeSession {
    device: FakeDevice,
    token: CancellationToken,
}

#[async_trait]
impl Session for FakeSession {
    fn serial(&self) -> &str {
        "FAKE0001"
    }

    async fn execute_command(&self, command: &str) -> Result<String> {
        if self.token.is_cancelled() {
            bail!("Device disconnected");
        }
        let (response, delay) = self.device.answer(command);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response.map_err(|e| anyhow!(e))
    }

    async fn open_upload_channel(&self, remote_path: &str) -> Result<Box<dyn UploadSink>> {
        if self.token.is_cancelled() {
            bail!("Device disconnected");
        }
        self.device.state.lock().unwrap().commands.push(format!("push {remote_path}"));
        Ok(Box::new(FakeUpload { device: self.device.clone(), written: 0 }))
    }

    fn disconnected(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<()> {
        self.device.state.lock().unwrap().closes += 1;
        self.token.cancel();
        Ok(())
    }
}

struct FakeUpload {
    device: FakeDevice,
    written: usize,
}

#[async_trait]
impl UploadSink for FakeUpload {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += 1;
        let mut state = self.device.state.lock().unwrap();
        if state.fail_upload_at == Some(self.written) {
            bail!("Sync channel broken");
        }
        state.upload_chunks.push(chunk.to_vec());
        Ok(())
    }

    async fn dispose(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ObserverEvent {
    State(UiState),
    Progress(TransferProgress),
    Notification(Notification),
    Confirm(ConfirmPrompt),
}

/// Observer that records every event and answers confirmations with a fixed value
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
    accept: AtomicBool,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), accept: AtomicBool::new(true) })
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn states(&self) -> Vec<UiState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn last_state(&self) -> Option<UiState> {
        self.states().pop()
    }

    pub fn progress(&self) -> Vec<TransferProgress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn confirmations(&self) -> Vec<ConfirmPrompt> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::Confirm(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProvisionObserver for RecordingObserver {
    fn state_changed(&self, state: &UiState) {
        self.events.lock().unwrap().push(ObserverEvent::State(state.clone()));
    }

    fn progress(&self, progress: TransferProgress) {
        self.events.lock().unwrap().push(ObserverEvent::Progress(progress));
    }

    fn notify(&self, notification: Notification) {
        self.events.lock().unwrap().push(ObserverEvent::Notification(notification));
    }

    async fn confirm(&self, prompt: ConfirmPrompt) -> bool {
        self.events.lock().unwrap().push(ObserverEvent::Confirm(prompt));
        self.accept.load(Ordering::SeqCst)
    }
}
