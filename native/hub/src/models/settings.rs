use lazy_regex::{Lazy, Regex, lazy_regex};
use rinf::SignalPiece;
use serde::{Deserialize, Serialize};

use crate::{adb::PackageName, error::ProvisionError};

/// Class part of a component name, either fully qualified or relative (`.receivers.Admin`)
static COMPONENT_CLASS_REGEX: Lazy<Regex> = lazy_regex!(r"^\.?[A-Za-z][\w.$]*$");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SignalPiece)]
pub struct Settings {
    pub adb_path: String,
    /// Package of the managed application
    pub package_name: String,
    /// Device admin component passed to `dpm set-device-owner`
    pub admin_receiver: String,
    #[serde(default)]
    pub apk_download_url: String,
    pub downloads_location: String,
    /// Serial to pick when several devices are attached (first available device if empty)
    #[serde(default)]
    pub preferred_serial: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            package_name: "com.startac.timeatt".to_string(),
            admin_receiver: "com.startac.timeatt/.receivers.AdminReceiver".to_string(),
            apk_download_url: "".to_string(),
            downloads_location: dirs::download_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_default()
                .join("Provisioner")
                .to_string_lossy()
                .to_string(),
            preferred_serial: "".to_string(),
        }
    }
}

/// Validated managed-application coordinates derived from [`Settings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub package: PackageName,
    pub admin_receiver: String,
}

impl Settings {
    /// Validates the package name and admin receiver component.
    ///
    /// The receiver must have the form `<package>/<class>`, belong to the managed package and
    /// name a plain Java class.
    pub fn provision_target(&self) -> Result<ProvisionTarget, ProvisionError> {
        let package = PackageName::parse(&self.package_name)
            .map_err(|e| ProvisionError::InvalidConfiguration(format!("{e:#}")))?;
        let receiver = self.admin_receiver.trim();
        match receiver.split_once('/') {
            Some((owner, class))
                if owner == package.as_str() && COMPONENT_CLASS_REGEX.is_match(class) =>
            {
                Ok(ProvisionTarget { package, admin_receiver: receiver.to_string() })
            }
            _ => Err(ProvisionError::InvalidConfiguration(format!(
                "Admin receiver '{receiver}' must be a component of '{package}'"
            ))),
        }
    }
}
