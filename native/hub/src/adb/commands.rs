//! Device shell commands used by the provisioner and the classifiers that interpret their
//! output.
//!
//! The device shell gives no usable exit status for these tools, so every verdict is
//! derived from substrings of the merged output. The patterns are matched verbatim.

use const_format::concatcp;
use lazy_regex::{Lazy, Regex, lazy_regex};

use super::PackageName;

/// Fixed location of the APK while it is being installed
pub const REMOTE_APK_PATH: &str = "/data/local/tmp/app.apk";

pub(crate) const INSTALL_COMMAND: &str = concatcp!("pm install -r ", REMOTE_APK_PATH, " 2>&1");
pub(crate) const CLEANUP_COMMAND: &str = concatcp!("rm -f ", REMOTE_APK_PATH);
pub(crate) const DEVICE_POLICY_DUMP_COMMAND: &str = "dumpsys device_policy";
pub(crate) const LIST_OWNERS_COMMAND: &str = "dpm list-owners 2>/dev/null || echo \"\"";
pub(crate) const REBOOT_COMMAND: &str = "reboot";

pub(crate) const MANUFACTURER_COMMAND: &str = "getprop ro.product.manufacturer";
pub(crate) const MODEL_COMMAND: &str = "getprop ro.product.model";
pub(crate) const ANDROID_VERSION_COMMAND: &str = "getprop ro.build.version.release";
pub(crate) const SERIAL_COMMAND: &str = "getprop ro.serialno";

static VERSION_NAME_REGEX: Lazy<Regex> = lazy_regex!(r"versionName=(\S+)");

pub(crate) fn list_package_command(package: &PackageName) -> String {
    format!("pm list packages {package}")
}

pub(crate) fn dump_package_command(package: &PackageName) -> String {
    format!("dumpsys package {package}")
}

pub(crate) fn set_device_owner_command(admin_receiver: &str) -> String {
    format!("dpm set-device-owner {admin_receiver} 2>&1")
}

/// Asks the managed app to clear its own device owner status
pub(crate) fn clear_owner_broadcast_command(package: &PackageName) -> String {
    format!(
        "am broadcast -a {package}.CLEAR_DEVICE_OWNER -n {package}/.receivers.ClearDeviceOwnerReceiver 2>&1"
    )
}

pub(crate) fn uninstall_command(package: &PackageName) -> String {
    format!("pm uninstall {package} 2>&1")
}

/// Verdict of a package manager command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// Result of `dpm set-device-owner`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOwnerOutcome {
    Success,
    /// Accounts must be removed from the device before an owner can be set
    AccountsPresent,
    Failed,
}

/// Result of the device owner removal flow, decided by the post-broadcast owner check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOwnerOutcome {
    Removed,
    StillOwner,
}

fn package_manager_verdict(output: &str) -> Verdict {
    if output.to_lowercase().contains("success") { Verdict::Success } else { Verdict::Failure }
}

pub fn classify_install(output: &str) -> Verdict {
    package_manager_verdict(output)
}

pub fn classify_uninstall(output: &str) -> Verdict {
    package_manager_verdict(output)
}

pub fn classify_set_owner(output: &str) -> SetOwnerOutcome {
    if output.contains("already some accounts") {
        SetOwnerOutcome::AccountsPresent
    } else if output.contains("Success") || output.contains("Active admin") {
        SetOwnerOutcome::Success
    } else {
        SetOwnerOutcome::Failed
    }
}

/// Whether `pm list packages <pkg>` reported the package
pub fn package_listed(output: &str, package: &PackageName) -> bool {
    output.contains(package.as_str())
}

/// Extracts `versionName` from `dumpsys package <pkg>`
pub fn parse_version_name(output: &str) -> Option<String> {
    VERSION_NAME_REGEX.captures(output).map(|caps| caps[1].to_string())
}

/// Whether `dumpsys device_policy` names the package as device owner
pub fn owner_in_policy_dump(output: &str, package: &PackageName) -> bool {
    output.contains("Device Owner") && output.contains(&format!("package={package}"))
}

/// Whether `dpm list-owners` mentions the package
pub fn owner_listed(output: &str, package: &PackageName) -> bool {
    output.contains(package.as_str())
}
