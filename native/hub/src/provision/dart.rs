use std::{
    collections::HashMap,
    error::Error,
    path::Path,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use rinf::{DartSignal, RustSignal};
use tokio::{
    sync::{Mutex, oneshot},
    time,
};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use super::{ConfirmPrompt, ProvisionObserver, Provisioner};
use crate::{
    error::ProvisionError,
    models::signals::{
        provision::{
            ProvisionCommand, ProvisionCommandCompleted, ProvisionRequest, TransferProgress,
            UiState,
        },
        system::{ConfirmationRequested, ConfirmationResponse, Notification},
    },
};

/// How long a confirmation dialog may stay unanswered before it counts as declined
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Forwards state, progress and notifications to the Flutter UI and asks it for confirmations
#[derive(Debug, Default)]
pub struct DartObserver {
    /// Confirmation requests waiting for an answer, by key
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl DartObserver {
    pub fn new() -> Arc<Self> {
        let observer = Arc::new(Self::default());
        tokio::spawn(
            Self::receive_confirmations(Arc::downgrade(&observer))
                .instrument(info_span!("task_receive_confirmations")),
        );
        observer
    }

    async fn receive_confirmations(observer: Weak<Self>) {
        let receiver = ConfirmationResponse::get_dart_signal_receiver();
        while let Some(response) = receiver.recv().await {
            let Some(observer) = observer.upgrade() else { break };
            let ConfirmationResponse { key, accepted } = response.message;
            match observer.pending.lock().await.remove(&key) {
                Some(sender) => {
                    // The requester may have given up already
                    let _ = sender.send(accepted);
                }
                None => warn!(%key, "Confirmation response without a pending request"),
            }
        }
        debug!("Confirmation receiver closed");
    }

    /// Waits for the answer to `key`. A request left unanswered for `limit` is declined.
    async fn await_answer(&self, key: &str, rx: oneshot::Receiver<bool>, limit: Duration) -> bool {
        match time::timeout(limit, rx).await {
            Ok(answer) => answer.unwrap_or(false),
            Err(_) => {
                warn!(%key, "Confirmation request timed out, treating it as declined");
                self.pending.lock().await.remove(key);
                false
            }
        }
    }
}

#[async_trait]
impl ProvisionObserver for DartObserver {
    fn state_changed(&self, state: &UiState) {
        state.clone().send_signal_to_dart();
    }

    fn progress(&self, progress: TransferProgress) {
        progress.send_signal_to_dart();
    }

    fn notify(&self, notification: Notification) {
        notification.send_signal_to_dart();
    }

    async fn confirm(&self, prompt: ConfirmPrompt) -> bool {
        let key = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);
        ConfirmationRequested { key: key.clone(), message: prompt.message() }.send_signal_to_dart();
        self.await_answer(&key, rx, CONFIRMATION_TIMEOUT).await
    }
}

/// Runs one UI command against the provisioner
#[instrument(level = "debug", skip(provisioner), err)]
pub(crate) async fn dispatch(
    provisioner: &Arc<Provisioner>,
    command: ProvisionCommand,
) -> Result<(), ProvisionError> {
    match command {
        ProvisionCommand::Connect => provisioner.connect().await,
        ProvisionCommand::Disconnect => {
            provisioner.disconnect().await;
            Ok(())
        }
        ProvisionCommand::RefreshStatus => provisioner.refresh_status().await.map(|_| ()),
        ProvisionCommand::InstallApk(path) => provisioner.install_apk(Path::new(&path)).await,
        ProvisionCommand::DownloadAndInstall => provisioner.download_and_install().await,
        ProvisionCommand::SetDeviceOwner => provisioner.set_device_owner().await,
        ProvisionCommand::RemoveDeviceOwner => provisioner.remove_device_owner().await,
        ProvisionCommand::UninstallApp => provisioner.uninstall_app().await,
        ProvisionCommand::Reboot => provisioner.reboot().await,
    }
}

/// Receives provisioning commands from Dart. Each command runs on its own task so the busy
/// guard can turn away overlapping requests.
pub async fn receive_commands(provisioner: Arc<Provisioner>) {
    let receiver = ProvisionRequest::get_dart_signal_receiver();
    info!("Listening for provisioning commands");
    while let Some(request) = receiver.recv().await {
        let ProvisionRequest { command, command_key } = request.message;
        debug!(?command, key = %command_key, "Received provisioning command");
        let provisioner = provisioner.clone();
        tokio::spawn(
            async move {
                let result = dispatch(&provisioner, command).await;
                match &result {
                    Err(e @ (ProvisionError::Busy | ProvisionError::Declined)) => {
                        debug!(error = e as &dyn Error, "Command not executed")
                    }
                    Err(e) => warn!(error = e as &dyn Error, "Provisioning command failed"),
                    Ok(()) => {}
                }
                ProvisionCommandCompleted {
                    command_key,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
                .send_signal_to_dart();
            }
            .instrument(info_span!("task_provision_command")),
        );
    }
    panic!("ProvisionRequest receiver closed");
}
