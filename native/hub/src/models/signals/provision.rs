use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};

use crate::models::{AppStatus, DeviceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Actions the UI should currently offer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub struct AllowedActions {
    pub connect: bool,
    pub disconnect: bool,
    pub install: bool,
    pub set_owner: bool,
    pub remove_owner: bool,
    pub uninstall: bool,
    pub reboot: bool,
}

/// Snapshot of the provisioning state machine. The UI renders this as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RustSignal)]
pub struct UiState {
    pub phase: ConnectionPhase,
    pub identity: Option<DeviceIdentity>,
    pub status: Option<AppStatus>,
    pub actions: AllowedActions,
    /// Show the APK install section
    pub install_section: bool,
    /// Show the device owner / uninstall section
    pub provisioning_section: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum TransferStage {
    Uploading,
    Installing,
    CleaningUp,
    Finished,
    /// Job settled, progress indicator reset and hidden
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, RustSignal)]
pub struct TransferProgress {
    /// 0-100
    pub percent: u8,
    pub stage: TransferStage,
}

impl TransferProgress {
    pub fn visible(&self) -> bool {
        self.stage != TransferStage::Hidden
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, SignalPiece)]
pub enum ProvisionCommand {
    Connect,
    Disconnect,
    RefreshStatus,
    /// Install the APK at the given local path
    InstallApk(String),
    /// Download the APK from the configured URL, then install it
    DownloadAndInstall,
    SetDeviceOwner,
    RemoveDeviceOwner,
    UninstallApp,
    Reboot,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct ProvisionRequest {
    pub command: ProvisionCommand,
    /// Arbitrary identifier to correlate completion events with UI elements
    pub command_key: String,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct ProvisionCommandCompleted {
    pub command_key: String,
    pub success: bool,
    pub error: Option<String>,
}
