use std::sync::Arc;

use derive_more::Debug;

use crate::{
    adb::{executor::CommandExecutor, transport::Session},
    models::{
        AppStatus, DeviceIdentity,
        signals::provision::{AllowedActions, ConnectionPhase, UiState},
    },
};

/// The connected device, owned by the state machine
#[derive(Debug, Clone)]
pub(super) struct ActiveSession {
    #[debug(skip)]
    pub handle: Arc<dyn Session>,
    pub identity: DeviceIdentity,
    /// Last successfully queried status
    pub status: Option<AppStatus>,
    /// Distinguishes this session from earlier ones in late disconnect notifications
    pub epoch: u64,
}

impl ActiveSession {
    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(Some(self.handle.clone()))
    }
}

#[derive(Debug)]
pub(super) struct MachineState {
    pub phase: ConnectionPhase,
    pub session: Option<ActiveSession>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self { phase: ConnectionPhase::Disconnected, session: None }
    }
}

impl MachineState {
    /// Drops the session and everything derived from it
    pub fn reset(&mut self) -> Option<ActiveSession> {
        self.phase = ConnectionPhase::Disconnected;
        self.session.take()
    }

    pub fn ui_state(&self) -> UiState {
        let session = self.session.as_ref().filter(|_| self.phase == ConnectionPhase::Connected);
        let status = session.and_then(|s| s.status.clone());
        let actions = allowed_actions(self.phase, status.as_ref());
        let connected = session.is_some();
        let installed = status.as_ref().is_some_and(AppStatus::installed);
        UiState {
            phase: self.phase,
            identity: session.map(|s| s.identity.clone()),
            status,
            actions,
            install_section: connected && !installed,
            provisioning_section: connected && installed,
        }
    }
}

pub(super) fn allowed_actions(phase: ConnectionPhase, status: Option<&AppStatus>) -> AllowedActions {
    match phase {
        ConnectionPhase::Disconnected => AllowedActions { connect: true, ..Default::default() },
        ConnectionPhase::Connecting => AllowedActions::default(),
        ConnectionPhase::Connected => {
            let installed = status.is_some_and(AppStatus::installed);
            let owner = status.is_some_and(AppStatus::is_device_owner);
            AllowedActions {
                connect: false,
                disconnect: true,
                install: !installed,
                set_owner: installed && !owner,
                remove_owner: owner,
                uninstall: installed && !owner,
                reboot: true,
            }
        }
    }
}
