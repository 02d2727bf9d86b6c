use rinf::SignalPiece;
use serde::{Deserialize, Serialize};

/// Installation and management status of the managed application.
///
/// Recomputed after every state-changing action and never persisted. A package that is not
/// installed can never be reported as device owner; the constructor enforces this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub struct AppStatus {
    installed: bool,
    version_name: Option<String>,
    is_device_owner: bool,
}

impl AppStatus {
    pub fn new(installed: bool, version_name: Option<String>, is_device_owner: bool) -> Self {
        if !installed {
            return Self::not_installed();
        }
        Self { installed, version_name, is_device_owner }
    }

    pub fn not_installed() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn version_name(&self) -> Option<&str> {
        self.version_name.as_deref()
    }

    pub fn is_device_owner(&self) -> bool {
        self.is_device_owner
    }
}
