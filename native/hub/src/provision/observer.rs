use async_trait::async_trait;

use crate::models::signals::{
    provision::{TransferProgress, UiState},
    system::Notification,
};

/// Destructive action waiting for the user's go-ahead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmPrompt {
    RemoveDeviceOwner,
    UninstallApp { package: String },
    Reboot,
}

impl ConfirmPrompt {
    pub fn message(&self) -> String {
        match self {
            Self::RemoveDeviceOwner => {
                "Remove device owner mode? The device will no longer be managed.".to_string()
            }
            Self::UninstallApp { package } => format!("Uninstall {package} from the device?"),
            Self::Reboot => "Reboot the device?".to_string(),
        }
    }
}

/// Receives everything the provisioner wants the user to see
#[async_trait]
pub trait ProvisionObserver: Send + Sync {
    fn state_changed(&self, state: &UiState);

    fn progress(&self, progress: TransferProgress);

    fn notify(&self, notification: Notification);

    /// Asks the user to confirm `prompt`. Returns `false` when declined.
    async fn confirm(&self, prompt: ConfirmPrompt) -> bool;
}
