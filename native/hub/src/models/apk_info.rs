use std::path::Path;

use anyhow::{Context, Result, anyhow};
use apk_info::Apk;
use tracing::instrument;

#[derive(Debug, Clone)]
pub(crate) struct ApkInfo {
    pub package_name: String,
    pub version_name: Option<String>,
}

/// Reads the manifest package and version name from an APK using `apk_info` crate.
#[instrument(ret, level = "debug", fields(apk_path = %apk_path.as_ref().display()))]
pub(crate) fn get_apk_info(apk_path: impl AsRef<Path>) -> Result<ApkInfo> {
    let apk_path = apk_path.as_ref();
    if !apk_path.exists() {
        return Err(anyhow!("APK file not found: {}", apk_path.display()));
    }

    let apk = Apk::new(apk_path).context("Failed to read APK file")?;
    let package_name = apk.get_package_name().ok_or_else(|| anyhow!("APK missing package name"))?;
    let version_name = apk.get_version_name();

    Ok(ApkInfo { package_name, version_name })
}
