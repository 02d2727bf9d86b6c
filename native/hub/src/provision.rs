use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use tokio::{
    sync::{Mutex, MutexGuard, RwLock, watch},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::{
    adb::{
        PackageName,
        commands::{
            ANDROID_VERSION_COMMAND, CLEANUP_COMMAND, DEVICE_POLICY_DUMP_COMMAND,
            LIST_OWNERS_COMMAND, MANUFACTURER_COMMAND, MODEL_COMMAND, REBOOT_COMMAND,
            RemoveOwnerOutcome, SERIAL_COMMAND, SetOwnerOutcome, Verdict,
            clear_owner_broadcast_command, classify_set_owner, classify_uninstall,
            dump_package_command, list_package_command, owner_in_policy_dump, owner_listed,
            package_listed, parse_version_name, set_device_owner_command, uninstall_command,
        },
        executor::CommandExecutor,
        transfer::{ApkPayload, push_and_install},
        transport::{Session, Transport},
    },
    downloader::{download_apk, http_client},
    error::ProvisionError,
    models::{
        AppStatus, DeviceIdentity, ProvisionTarget, Settings,
        apk_info::get_apk_info,
        signals::{
            provision::{ConnectionPhase, TransferProgress, TransferStage, UiState},
            system::{Notification, NotificationKind},
        },
    },
};

pub mod dart;
mod observer;
mod state;

pub use observer::{ConfirmPrompt, ProvisionObserver};
use state::{ActiveSession, MachineState};

/// Time the managed app gets to handle the clear-owner broadcast before the owner is re-checked
const OWNER_REMOVAL_GRACE: Duration = Duration::from_millis(1500);
/// Delay between a finished install and hiding the progress indicator
const PROGRESS_SETTLE_DELAY: Duration = Duration::from_millis(2000);

/// Provisioning state machine.
///
/// Owns the single device session. User actions are serialized by a busy guard: an action
/// started while another one is running fails with [`ProvisionError::Busy`]. `disconnect` is
/// the only action that bypasses the guard.
#[derive(Debug)]
pub struct Provisioner {
    #[debug(skip)]
    transport: Arc<dyn Transport>,
    #[debug(skip)]
    observer: Arc<dyn ProvisionObserver>,
    settings: watch::Receiver<Settings>,
    #[debug(skip)]
    http_client: reqwest::Client,
    state: RwLock<MachineState>,
    busy: Mutex<()>,
    next_epoch: AtomicU64,
    /// Incremented by every install job. Pending progress resets only fire for the latest job.
    install_generation: Arc<AtomicU64>,
}

/// Reads installation, version and device owner status of `package`.
#[instrument(level = "debug", skip(executor), ret, err)]
async fn query_app_status(
    executor: &CommandExecutor,
    package: &PackageName,
) -> Result<AppStatus, ProvisionError> {
    let installed = executor
        .execute_classified(&list_package_command(package), |out| package_listed(out, package))
        .await?;
    if !installed {
        return Ok(AppStatus::not_installed());
    }
    let version_name =
        executor.execute_classified(&dump_package_command(package), parse_version_name).await?;
    let is_owner = executor
        .execute_classified(DEVICE_POLICY_DUMP_COMMAND, |out| owner_in_policy_dump(out, package))
        .await?;
    Ok(AppStatus::new(true, version_name, is_owner))
}

/// Logs a mismatch between the APK manifest and the managed package. Never blocks the install.
async fn preflight_apk(path: &Path, package: &PackageName) {
    let apk_path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || get_apk_info(apk_path)).await {
        Ok(Ok(info)) if info.package_name != package.as_str() => warn!(
            apk_package = %info.package_name,
            expected = %package,
            "APK package does not match the managed package"
        ),
        Ok(Ok(info)) => debug!(version = ?info.version_name, "APK manifest matches"),
        Ok(Err(e)) => warn!(error = e.as_ref() as &dyn Error, "Failed to read APK manifest"),
        Err(e) => warn!(error = &e as &dyn Error, "APK preflight task failed"),
    }
}

async fn close_quietly(session: &Arc<dyn Session>) {
    if let Err(e) = session.close().await {
        warn!(error = e.as_ref() as &dyn Error, serial = session.serial(), "Failed to close session");
    }
}

impl Provisioner {
    pub fn new(
        transport: Arc<dyn Transport>,
        observer: Arc<dyn ProvisionObserver>,
        settings: watch::Receiver<Settings>,
    ) -> Arc<Self> {
        let http_client = http_client().unwrap_or_else(|e| {
            warn!(error = e.as_ref() as &dyn Error, "Falling back to default HTTP client");
            reqwest::Client::new()
        });
        Arc::new(Self {
            transport,
            observer,
            settings,
            http_client,
            state: RwLock::new(MachineState::default()),
            busy: Mutex::new(()),
            next_epoch: AtomicU64::new(1),
            install_generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub async fn ui_state(&self) -> UiState {
        self.state.read().await.ui_state()
    }

    /// Sends the current state to the observer
    pub async fn publish_state(&self) {
        let state = self.state.read().await;
        self.observer.state_changed(&state.ui_state());
    }

    fn try_begin(&self) -> Result<MutexGuard<'_, ()>, ProvisionError> {
        self.busy.try_lock().map_err(|_| {
            debug!("Another operation is in progress, ignoring request");
            ProvisionError::Busy
        })
    }

    fn notify(&self, kind: NotificationKind, message: impl Into<String>) {
        self.observer.notify(Notification::transient(kind, message));
    }

    async fn active_session(&self) -> Result<ActiveSession, ProvisionError> {
        let state = self.state.read().await;
        match (&state.phase, &state.session) {
            (ConnectionPhase::Connected, Some(session)) => Ok(session.clone()),
            _ => {
                warn!("No device connected");
                Err(ProvisionError::NotConnected)
            }
        }
    }

    fn target(&self) -> Result<ProvisionTarget, ProvisionError> {
        self.settings.borrow().provision_target().inspect_err(|e| {
            error!(error = e as &dyn Error, "Invalid provisioning settings");
            self.notify(NotificationKind::Error, e.to_string());
        })
    }

    /// Connects to a device, replacing the current session if there is one.
    #[instrument(skip(self), err)]
    pub async fn connect(self: &Arc<Self>) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        self.close_session().await;
        {
            let mut state = self.state.write().await;
            state.phase = ConnectionPhase::Connecting;
            self.observer.state_changed(&state.ui_state());
        }

        match self.establish().await {
            Ok(identity) => {
                info!(%identity, "Device connected");
                if let Err(e) = self.reload_status().await {
                    warn!(error = &e as &dyn Error, "Failed to query app status after connect");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = &e as &dyn Error, "Failed to connect");
                {
                    let mut state = self.state.write().await;
                    state.reset();
                    self.observer.state_changed(&state.ui_state());
                }
                self.notify(NotificationKind::Error, format!("Failed to connect: {e}"));
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<DeviceIdentity, ProvisionError> {
        let handle = self.transport.connect().await?;
        let executor = CommandExecutor::new(Some(handle.clone()));

        let identity = match tokio::try_join!(
            executor.execute(MANUFACTURER_COMMAND),
            executor.execute(MODEL_COMMAND),
            executor.execute(ANDROID_VERSION_COMMAND),
            executor.execute(SERIAL_COMMAND),
        ) {
            Ok((manufacturer, model, android_version, serial)) => {
                let serial = if serial.is_empty() { handle.serial().to_string() } else { serial };
                DeviceIdentity::from_properties(&manufacturer, &model, &android_version, &serial)
            }
            Err(e) => {
                close_quietly(&handle).await;
                return Err(e);
            }
        };

        // Leftover from an interrupted install
        if let Err(e) = executor.execute(CLEANUP_COMMAND).await {
            debug!(error = &e as &dyn Error, "Failed to remove stale temporary APK");
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            if state.phase != ConnectionPhase::Connecting {
                drop(state);
                info!("Disconnected while connecting, dropping new session");
                close_quietly(&handle).await;
                return Err(ProvisionError::NotConnected);
            }
            state.phase = ConnectionPhase::Connected;
            state.session = Some(ActiveSession {
                handle: handle.clone(),
                identity: identity.clone(),
                status: None,
                epoch,
            });
            self.observer.state_changed(&state.ui_state());
        }
        self.arm_disconnect_listener(handle.disconnected(), epoch);
        Ok(identity)
    }

    /// Resets the machine once the session identified by `epoch` reports a disconnect
    fn arm_disconnect_listener(self: &Arc<Self>, token: CancellationToken, epoch: u64) {
        let provisioner = Arc::downgrade(self);
        tokio::spawn(
            async move {
                token.cancelled().await;
                if let Some(provisioner) = provisioner.upgrade() {
                    provisioner.handle_disconnected(epoch).await;
                }
            }
            .instrument(info_span!("task_disconnect_listener", epoch)),
        );
    }

    async fn handle_disconnected(&self, epoch: u64) {
        let closed = {
            let mut state = self.state.write().await;
            if state.session.as_ref().is_none_or(|s| s.epoch != epoch) {
                debug!("Session already released");
                return;
            }
            let closed = state.reset();
            self.observer.state_changed(&state.ui_state());
            closed
        };
        if let Some(session) = closed {
            warn!(serial = session.handle.serial(), "Device disconnected");
            close_quietly(&session.handle).await;
        }
        self.notify(NotificationKind::Warning, "Device disconnected");
    }

    async fn close_session(&self) {
        let closed = {
            let mut state = self.state.write().await;
            let changed = state.phase != ConnectionPhase::Disconnected || state.session.is_some();
            let closed = state.reset();
            if changed {
                self.observer.state_changed(&state.ui_state());
            }
            closed
        };
        if let Some(session) = closed {
            close_quietly(&session.handle).await;
            info!(serial = session.handle.serial(), "Session closed");
        }
    }

    /// Releases the session. Calling it while disconnected does nothing.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.close_session().await;
    }

    async fn store_status(&self, epoch: u64, status: AppStatus) {
        let mut state = self.state.write().await;
        let Some(session) = state.session.as_mut().filter(|s| s.epoch == epoch) else {
            debug!("Session changed, discarding app status");
            return;
        };
        session.status = Some(status);
        self.observer.state_changed(&state.ui_state());
    }

    /// Re-queries the app status. On failure the last known status stays in place.
    async fn reload_status(&self) -> Result<AppStatus, ProvisionError> {
        let session = self.active_session().await?;
        let target = self.target()?;
        let status = query_app_status(&session.executor(), &target.package).await?;
        self.store_status(session.epoch, status.clone()).await;
        Ok(status)
    }

    async fn reload_status_logged(&self) {
        if let Err(e) = self.reload_status().await {
            warn!(error = &e as &dyn Error, "Failed to refresh app status");
        }
    }

    #[instrument(skip(self), err)]
    pub async fn refresh_status(&self) -> Result<AppStatus, ProvisionError> {
        let _busy = self.try_begin()?;
        self.reload_status().await
    }

    async fn confirm(&self, prompt: ConfirmPrompt) -> Result<(), ProvisionError> {
        if self.observer.confirm(prompt.clone()).await {
            Ok(())
        } else {
            info!(?prompt, "Action declined");
            Err(ProvisionError::Declined)
        }
    }

    #[instrument(skip(self), err)]
    pub async fn set_device_owner(&self) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        let session = self.active_session().await?;
        let target = self.target()?;

        info!(receiver = %target.admin_receiver, "Setting device owner");
        let command = set_device_owner_command(&target.admin_receiver);
        let result = match session.executor().execute(&command).await {
            Ok(output) => match classify_set_owner(&output) {
                SetOwnerOutcome::AccountsPresent => {
                    error!(output, "Device owner blocked by accounts on the device");
                    self.observer.notify(Notification::persistent(
                        NotificationKind::Error,
                        "There are accounts on the device. Go to Settings > Accounts and remove ALL \
                         accounts (Google, Samsung, etc.) before continuing.",
                    ));
                    Err(ProvisionError::OperationRejectedByDevice(output))
                }
                SetOwnerOutcome::Success => {
                    info!("Device owner set");
                    self.notify(NotificationKind::Success, "Device owner mode enabled.");
                    Ok(())
                }
                SetOwnerOutcome::Failed => {
                    error!(output, "Failed to set device owner");
                    self.notify(
                        NotificationKind::Error,
                        "Failed to enable device owner mode. The device may be unsupported or \
                         already have an administrator.",
                    );
                    Err(ProvisionError::OperationRejectedByDevice(output))
                }
            },
            Err(e) => {
                error!(error = &e as &dyn Error, "Failed to run set device owner command");
                self.notify(
                    NotificationKind::Error,
                    "Failed to process the request. Check the USB connection.",
                );
                Err(e)
            }
        };

        self.reload_status_logged().await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn remove_device_owner(&self) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        let session = self.active_session().await?;
        let target = self.target()?;
        self.confirm(ConfirmPrompt::RemoveDeviceOwner).await?;
        self.clear_device_owner(&session, &target.package).await
    }

    /// Asks the app to drop its owner status, waits for it and checks the result.
    async fn clear_device_owner(
        &self,
        session: &ActiveSession,
        package: &PackageName,
    ) -> Result<(), ProvisionError> {
        info!("Removing device owner");
        let executor = session.executor();
        let outcome = async {
            let output = executor.execute(&clear_owner_broadcast_command(package)).await?;
            debug!(output, "Clear owner broadcast sent");
            time::sleep(OWNER_REMOVAL_GRACE).await;

            let status = query_app_status(&executor, package).await?;
            let outcome = if status.is_device_owner() {
                RemoveOwnerOutcome::StillOwner
            } else {
                RemoveOwnerOutcome::Removed
            };
            self.store_status(session.epoch, status).await;
            Ok::<_, ProvisionError>(outcome)
        }
        .await;

        match outcome {
            Ok(RemoveOwnerOutcome::Removed) => {
                info!("Device owner removed");
                self.notify(NotificationKind::Success, "Device owner mode removed.");
                Ok(())
            }
            Ok(RemoveOwnerOutcome::StillOwner) => {
                warn!("Device owner is still set, the app may be outdated");
                self.observer.notify(Notification::persistent(
                    NotificationKind::Warning,
                    "Device owner mode was not removed. Make sure the app is up to date.",
                ));
                Err(ProvisionError::OperationRejectedByDevice(format!(
                    "{package} is still device owner"
                )))
            }
            Err(e) => {
                error!(error = &e as &dyn Error, "Failed to remove device owner");
                self.notify(
                    NotificationKind::Error,
                    "Failed to process the request. Check the USB connection.",
                );
                Err(e)
            }
        }
    }

    /// Uninstalls the managed app, removing its device owner status first if needed.
    #[instrument(skip(self), err)]
    pub async fn uninstall_app(&self) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        let session = self.active_session().await?;
        let target = self.target()?;
        self.confirm(ConfirmPrompt::UninstallApp { package: target.package.to_string() }).await?;

        let executor = session.executor();
        let result = async {
            let owners = executor.execute(LIST_OWNERS_COMMAND).await?;
            let cached_owner = session.status.as_ref().is_some_and(AppStatus::is_device_owner);
            if owner_listed(&owners, &target.package) || cached_owner {
                info!("App is device owner, removing it first");
                if let Err(e) = self.clear_device_owner(&session, &target.package).await {
                    warn!(error = &e as &dyn Error, "Continuing uninstall with device owner set");
                }
            }

            let output = executor.execute(&uninstall_command(&target.package)).await?;
            match classify_uninstall(&output) {
                Verdict::Success => {
                    info!(package = %target.package, "App uninstalled");
                    Ok(())
                }
                Verdict::Failure => Err(ProvisionError::OperationRejectedByDevice(output)),
            }
        }
        .await;

        if let Err(e) = &result {
            error!(error = e as &dyn Error, "Failed to uninstall app");
        }
        self.reload_status_logged().await;
        result
    }

    /// Sends `reboot`. The session usually drops before the command returns.
    #[instrument(skip(self), err)]
    pub async fn reboot(&self) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        let session = self.active_session().await?;
        self.confirm(ConfirmPrompt::Reboot).await?;

        warn!(serial = session.handle.serial(), "Rebooting device");
        if let Err(e) = session.executor().execute(REBOOT_COMMAND).await {
            debug!(error = &e as &dyn Error, "Reboot command did not complete");
        }
        Ok(())
    }

    /// Installs an APK provided in memory
    #[instrument(skip(self), err)]
    pub async fn install(&self, payload: ApkPayload) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        let session = self.active_session().await?;
        self.run_install(&session, payload).await
    }

    /// Installs the APK at `path`
    #[instrument(skip(self), err)]
    pub async fn install_apk(&self, path: &Path) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        self.install_from_path(path).await
    }

    /// Downloads the APK from the configured URL, then installs it
    #[instrument(skip(self), err)]
    pub async fn download_and_install(&self) -> Result<(), ProvisionError> {
        let _busy = self.try_begin()?;
        self.active_session().await?;

        let (url, downloads_location) = {
            let settings = self.settings.borrow();
            (settings.apk_download_url.clone(), PathBuf::from(&settings.downloads_location))
        };
        let path = download_apk(&self.http_client, &url, &downloads_location).await.map_err(|e| {
            error!(error = e.as_ref() as &dyn Error, "Failed to download APK");
            self.notify(NotificationKind::Error, format!("Failed to download the APK: {e:#}"));
            ProvisionError::InvalidPayload(format!("{e:#}"))
        })?;
        self.install_from_path(&path).await
    }

    async fn install_from_path(&self, path: &Path) -> Result<(), ProvisionError> {
        let session = self.active_session().await?;
        let target = self.target()?;
        preflight_apk(path, &target.package).await;

        let payload = ApkPayload::from_path(path).await.inspect_err(|e| {
            error!(error = e as &dyn Error, "Failed to open APK");
            self.notify(NotificationKind::Error, e.to_string());
        })?;
        self.run_install(&session, payload).await
    }

    async fn run_install(
        &self,
        session: &ActiveSession,
        payload: ApkPayload,
    ) -> Result<(), ProvisionError> {
        let generation = self.install_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let observer = self.observer.clone();
        let result =
            push_and_install(&session.executor(), payload, |progress| observer.progress(progress))
                .await;

        match &result {
            Ok(()) => {
                info!("APK installed");
                self.notify(NotificationKind::Success, "App installed successfully.");
            }
            Err(ProvisionError::OperationRejectedByDevice(output)) => {
                error!(output, "Package manager rejected the APK");
                self.notify(
                    NotificationKind::Error,
                    "Failed to install the app. Check that the APK file is valid.",
                );
            }
            Err(e) => {
                error!(error = e as &dyn Error, "Install failed");
                self.notify(NotificationKind::Error, format!("Failed to install the app: {e}"));
            }
        }

        self.reload_status_logged().await;
        self.schedule_progress_reset(generation);
        result
    }

    /// Hides the progress indicator after the settle delay unless a newer install has started
    fn schedule_progress_reset(&self, generation: u64) {
        let observer = self.observer.clone();
        let install_generation = self.install_generation.clone();
        tokio::spawn(
            async move {
                time::sleep(PROGRESS_SETTLE_DELAY).await;
                if install_generation.load(Ordering::SeqCst) != generation {
                    debug!(generation, "Newer install running, keeping progress visible");
                    return;
                }
                observer.progress(TransferProgress { percent: 0, stage: TransferStage::Hidden });
            }
            .instrument(info_span!("task_progress_settle", generation)),
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::{
        adb::commands::INSTALL_COMMAND,
        testing::{FakeDevice, RecordingObserver},
    };

    const PACKAGE: &str = "com.startac.timeatt";
    const OWNER_DUMP: &str = "Device Owner: \n  admin=ComponentInfo{com.startac.timeatt/.receivers.AdminReceiver}\n  name=\n  package=com.startac.timeatt\n";
    const NO_OWNER_DUMP: &str = "Device Policy Manager: \n  Enabled Device Admins (User 0, provisioningState: 0):\n";

    fn setup() -> (FakeDevice, Arc<RecordingObserver>, Arc<Provisioner>) {
        setup_with(Settings::default())
    }

    fn setup_with(settings: Settings) -> (FakeDevice, Arc<RecordingObserver>, Arc<Provisioner>) {
        let device = FakeDevice::new();
        device.respond("getprop ro.product.manufacturer", "samsung\n");
        device.respond("getprop ro.product.model", "SM-T220\n");
        device.respond("getprop ro.build.version.release", "13\n");
        device.respond("getprop ro.serialno", "R9XT1234ABC\n");
        let observer = RecordingObserver::new();
        let (_tx, rx) = watch::channel(settings);
        let provisioner = Provisioner::new(device.transport(), observer.clone(), rx);
        (device, observer, provisioner)
    }

    fn mark_installed(device: &FakeDevice) {
        device.respond("pm list packages", &format!("package:{PACKAGE}\n"));
        device.respond("dumpsys package", "    versionCode=21 minSdk=26\n    versionName=2.1.0\n");
    }

    fn last_status(observer: &RecordingObserver) -> AppStatus {
        observer.last_state().and_then(|s| s.status).unwrap()
    }

    fn position(commands: &[String], prefix: &str) -> usize {
        commands.iter().position(|c| c.starts_with(prefix)).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn connect_reads_identity_and_missing_app() {
        let (device, observer, provisioner) = setup();

        provisioner.connect().await.unwrap();

        let state = provisioner.ui_state().await;
        assert_eq!(state.phase, ConnectionPhase::Connected);
        let identity = state.identity.unwrap();
        assert_eq!(identity.manufacturer, "samsung");
        assert_eq!(identity.model, "SM-T220");
        assert_eq!(identity.android_version, "13");
        assert_eq!(identity.serial, "R9XT1234ABC");

        let status = state.status.unwrap();
        assert!(!status.installed());
        assert!(!status.is_device_owner());
        assert!(state.install_section);
        assert!(!state.provisioning_section);
        assert!(state.actions.install && !state.actions.set_owner && !state.actions.connect);

        let phases = observer.states().iter().map(|s| s.phase).collect::<Vec<_>>();
        assert_eq!(phases.first(), Some(&ConnectionPhase::Connecting));
        assert!(device.commands().contains(&CLEANUP_COMMAND.to_string()));
        assert!(!device.commands().iter().any(|c| c.starts_with("dumpsys device_policy")));
    }

    #[test_log::test(tokio::test)]
    async fn blank_properties_are_shown_as_placeholders() {
        let (device, _observer, provisioner) = setup();
        device.respond("getprop ro.product.model", "  \n");
        device.respond("getprop ro.serialno", "");

        provisioner.connect().await.unwrap();

        let identity = provisioner.ui_state().await.identity.unwrap();
        assert_eq!(identity.model, "-");
        assert_eq!(identity.serial, "FAKE0001");
    }

    #[test_log::test(tokio::test)]
    async fn failed_connect_leaves_no_partial_identity() {
        let (device, observer, provisioner) = setup();
        device.fail_connect(ProvisionError::AuthenticationFailed("key rejected".to_string()));

        let err = provisioner.connect().await.unwrap_err();
        assert!(matches!(err, ProvisionError::AuthenticationFailed(_)));

        let state = provisioner.ui_state().await;
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.identity, None);
        assert!(state.actions.connect);
        let notification = observer.notifications().pop().unwrap();
        assert_eq!(notification.kind, NotificationKind::Error);
        assert!(notification.message.contains("key rejected"));
    }

    #[test_log::test(tokio::test)]
    async fn identity_failure_closes_the_session() {
        let (device, _observer, provisioner) = setup();
        device.fail("getprop ro.product.model", "protocol fault");

        let err = provisioner.connect().await.unwrap_err();
        assert!(matches!(err, ProvisionError::CommandExecutionFailed(ref m) if m.contains("protocol fault")));
        assert_eq!(device.close_count(), 1);
        assert_eq!(provisioner.ui_state().await.phase, ConnectionPhase::Disconnected);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn install_reports_progress_and_refreshes_status() {
        let (device, observer, provisioner) = setup();
        provisioner.connect().await.unwrap();
        assert!(!last_status(&observer).installed());

        device.respond("pm install", "Performing Streamed Install\nSuccess\n");
        mark_installed(&device);
        provisioner.install(ApkPayload::from_bytes(vec![0x5a; 200_000])).await.unwrap();

        let percents = observer.progress().iter().map(|p| p.percent).collect::<Vec<_>>();
        assert_eq!(percents, vec![0, 26, 52, 78, 80, 85, 95, 100]);
        let status = last_status(&observer);
        assert!(status.installed());
        assert_eq!(status.version_name(), Some("2.1.0"));
        let state = provisioner.ui_state().await;
        assert!(!state.install_section && state.provisioning_section);
        assert_eq!(observer.notifications().pop().unwrap().kind, NotificationKind::Success);

        time::sleep(Duration::from_millis(2100)).await;
        let last = observer.progress().pop().unwrap();
        assert_eq!(last, TransferProgress { percent: 0, stage: TransferStage::Hidden });
        assert!(!last.visible());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn earlier_settle_does_not_hide_a_running_install() {
        let (device, observer, provisioner) = setup();
        provisioner.connect().await.unwrap();
        device.respond("pm install", "Success");
        provisioner.install(ApkPayload::from_bytes(vec![7; 1024])).await.unwrap();

        time::sleep(Duration::from_millis(1000)).await;
        observer.clear();
        device.respond_after("pm install", "Success", Duration::from_secs(5));
        let second = tokio::spawn({
            let provisioner = provisioner.clone();
            async move { provisioner.install(ApkPayload::from_bytes(vec![8; 1024])).await }
        });

        // The first job's settle delay expires while the second one is inside `pm install`
        time::sleep(Duration::from_millis(1500)).await;
        assert!(!observer.progress().iter().any(|p| p.stage == TransferStage::Hidden));

        second.await.unwrap().unwrap();
        let percents = observer.progress().iter().map(|p| p.percent).collect::<Vec<_>>();
        assert_eq!(percents, vec![0, 80, 85, 95, 100]);

        time::sleep(PROGRESS_SETTLE_DELAY + Duration::from_millis(100)).await;
        let hidden = observer.progress().into_iter().filter(|p| p.stage == TransferStage::Hidden);
        assert_eq!(hidden.count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn rejected_install_still_reaches_100() {
        let (device, observer, provisioner) = setup();
        provisioner.connect().await.unwrap();
        device.respond("pm install", "Failure [INSTALL_PARSE_FAILED_NOT_APK]");

        let err = provisioner.install(ApkPayload::from_bytes(vec![1; 1024])).await.unwrap_err();

        assert!(matches!(err, ProvisionError::OperationRejectedByDevice(_)));
        assert_eq!(observer.progress().last().unwrap().percent, 100);
        assert_eq!(observer.notifications().pop().unwrap().kind, NotificationKind::Error);
        let commands = device.commands();
        assert!(position(&commands, INSTALL_COMMAND) < commands.len() - 1);
        assert!(!last_status(&observer).installed());
    }

    #[test_log::test(tokio::test)]
    async fn accounts_block_device_owner() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        device.respond("dumpsys device_policy", NO_OWNER_DUMP);
        provisioner.connect().await.unwrap();
        device.respond(
            "dpm set-device-owner",
            "java.lang.IllegalStateException: Not allowed to set the device owner because there \
             are already some accounts on the device",
        );

        let err = provisioner.set_device_owner().await.unwrap_err();

        assert!(matches!(err, ProvisionError::OperationRejectedByDevice(_)));
        let notification = observer.notifications().pop().unwrap();
        assert!(notification.is_persistent());
        assert_eq!(notification.kind, NotificationKind::Error);
        assert!(!last_status(&observer).is_device_owner());
    }

    #[test_log::test(tokio::test)]
    async fn device_owner_is_set() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        provisioner.connect().await.unwrap();
        device.respond("dpm set-device-owner", "Success: Device owner set to package com.startac.timeatt\nActive admin set to component {com.startac.timeatt/.receivers.AdminReceiver}");
        device.respond("dumpsys device_policy", OWNER_DUMP);

        provisioner.set_device_owner().await.unwrap();

        assert!(
            device
                .commands()
                .contains(&"dpm set-device-owner com.startac.timeatt/.receivers.AdminReceiver 2>&1".to_string())
        );
        assert!(last_status(&observer).is_device_owner());
        let state = provisioner.ui_state().await;
        assert!(state.actions.remove_owner && !state.actions.uninstall && !state.actions.set_owner);
        assert_eq!(observer.notifications().pop().unwrap().kind, NotificationKind::Success);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn owner_still_present_after_broadcast_warns() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        device.respond("dumpsys device_policy", OWNER_DUMP);
        provisioner.connect().await.unwrap();
        device.respond("am broadcast", "Broadcasting: Intent { act=com.startac.timeatt.CLEAR_DEVICE_OWNER }\nBroadcast completed: result=0");

        let err = provisioner.remove_device_owner().await.unwrap_err();

        assert!(matches!(err, ProvisionError::OperationRejectedByDevice(_)));
        let notification = observer.notifications().pop().unwrap();
        assert_eq!(notification.kind, NotificationKind::Warning);
        assert!(notification.is_persistent());
        assert!(last_status(&observer).is_device_owner());
        assert_eq!(observer.confirmations(), vec![ConfirmPrompt::RemoveDeviceOwner]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn owner_removed_after_grace_period() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        device.respond_sequence("dumpsys device_policy", &[OWNER_DUMP, NO_OWNER_DUMP]);
        provisioner.connect().await.unwrap();
        assert!(last_status(&observer).is_device_owner());
        device.clear_commands();

        let started = Instant::now();
        provisioner.remove_device_owner().await.unwrap();

        assert!(started.elapsed() >= OWNER_REMOVAL_GRACE);
        assert!(!last_status(&observer).is_device_owner());
        let commands = device.commands();
        assert!(position(&commands, "am broadcast") < position(&commands, "dumpsys device_policy"));
        assert_eq!(observer.notifications().pop().unwrap().kind, NotificationKind::Success);
    }

    #[test_log::test(tokio::test)]
    async fn declined_confirmation_sends_nothing() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        device.respond("dumpsys device_policy", OWNER_DUMP);
        provisioner.connect().await.unwrap();
        observer.set_accept(false);
        device.clear_commands();

        assert_eq!(provisioner.remove_device_owner().await, Err(ProvisionError::Declined));
        assert_eq!(provisioner.reboot().await, Err(ProvisionError::Declined));
        assert!(device.commands().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn uninstall_removes_device_owner_first() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        device.respond_sequence(
            "pm list packages",
            &["package:com.startac.timeatt", "package:com.startac.timeatt", ""],
        );
        device.respond("dumpsys device_policy", NO_OWNER_DUMP);
        provisioner.connect().await.unwrap();
        device.respond("dpm list-owners", "Device Owner: com.startac.timeatt/.receivers.AdminReceiver");
        device.respond("pm uninstall", "Success");

        provisioner.uninstall_app().await.unwrap();

        let commands = device.commands();
        let broadcast = position(&commands, "am broadcast");
        assert!(position(&commands, "dpm list-owners") < broadcast);
        assert!(broadcast < position(&commands, "pm uninstall"));
        assert_eq!(
            observer.confirmations(),
            vec![ConfirmPrompt::UninstallApp { package: PACKAGE.to_string() }]
        );
        let state = provisioner.ui_state().await;
        assert!(!state.status.unwrap().installed());
        assert!(state.install_section);
    }

    #[test_log::test(tokio::test)]
    async fn uninstall_without_owner_skips_removal() {
        let (device, _observer, provisioner) = setup();
        mark_installed(&device);
        provisioner.connect().await.unwrap();
        device.respond("pm uninstall", "Failure [DELETE_FAILED_INTERNAL_ERROR]");

        let err = provisioner.uninstall_app().await.unwrap_err();

        assert!(matches!(err, ProvisionError::OperationRejectedByDevice(_)));
        assert!(!device.commands().iter().any(|c| c.starts_with("am broadcast")));
    }

    #[test_log::test(tokio::test)]
    async fn reboot_does_not_refresh() {
        let (device, _observer, provisioner) = setup();
        provisioner.connect().await.unwrap();
        device.fail("reboot", "connection closed");
        device.clear_commands();

        provisioner.reboot().await.unwrap();

        assert_eq!(device.commands(), vec![REBOOT_COMMAND.to_string()]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn overlapping_actions_are_rejected() {
        let (device, _observer, provisioner) = setup();
        mark_installed(&device);
        provisioner.connect().await.unwrap();
        device.respond_after("pm install", "Success", Duration::from_secs(5));

        let install = tokio::spawn({
            let provisioner = provisioner.clone();
            async move { provisioner.install(ApkPayload::from_bytes(vec![0; 10])).await }
        });
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(provisioner.set_device_owner().await, Err(ProvisionError::Busy));
        assert_eq!(provisioner.connect().await, Err(ProvisionError::Busy));
        install.await.unwrap().unwrap();
        assert_eq!(device.sessions_opened(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_is_idempotent() {
        let (device, observer, provisioner) = setup();
        provisioner.connect().await.unwrap();

        provisioner.disconnect().await;
        provisioner.disconnect().await;
        tokio::task::yield_now().await;

        let state = provisioner.ui_state().await;
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.identity, None);
        assert_eq!(device.close_count(), 1);
        assert!(!observer.notifications().iter().any(|n| n.kind == NotificationKind::Warning));
        assert_eq!(provisioner.set_device_owner().await, Err(ProvisionError::NotConnected));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unplugged_device_resets_state_once() {
        let (device, observer, provisioner) = setup();
        mark_installed(&device);
        provisioner.connect().await.unwrap();

        device.unplug();
        time::sleep(Duration::from_millis(10)).await;

        let state = provisioner.ui_state().await;
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.status, None);
        let warnings = observer
            .notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::Warning)
            .count();
        assert_eq!(warnings, 1);

        // The listener is armed again for the next session
        provisioner.connect().await.unwrap();
        assert_eq!(provisioner.ui_state().await.phase, ConnectionPhase::Connected);
        device.unplug();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provisioner.ui_state().await.phase, ConnectionPhase::Disconnected);
    }

    #[test_log::test(tokio::test)]
    async fn reconnect_closes_previous_session() {
        let (device, _observer, provisioner) = setup();
        provisioner.connect().await.unwrap();
        provisioner.connect().await.unwrap();

        assert_eq!(device.sessions_opened(), 2);
        assert_eq!(device.close_count(), 1);
        assert_eq!(provisioner.ui_state().await.phase, ConnectionPhase::Connected);
    }

    #[test_log::test(tokio::test)]
    async fn invalid_settings_fail_actions() {
        let (device, observer, provisioner) = setup_with(Settings {
            package_name: "not a package".to_string(),
            ..Settings::default()
        });
        provisioner.connect().await.unwrap();
        device.clear_commands();

        let err = provisioner.set_device_owner().await.unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidConfiguration(_)));
        assert!(device.commands().is_empty());
        assert_eq!(observer.notifications().pop().unwrap().kind, NotificationKind::Error);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn downloads_then_installs() {
        use wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{method, path},
        };

        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/timeatt.apk"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x50; 70_000]))
            .mount(&server)
            .await;
        let (device, observer, provisioner) = setup_with(Settings {
            apk_download_url: format!("{}/timeatt.apk", server.uri()),
            downloads_location: dir.path().to_string_lossy().to_string(),
            ..Settings::default()
        });
        provisioner.connect().await.unwrap();
        device.respond("pm install", "Success");

        provisioner.download_and_install().await.unwrap();

        assert_eq!(device.uploaded_bytes().len(), 70_000);
        assert!(dir.path().join("app.apk").is_file());
        assert_eq!(observer.progress().last().unwrap().percent, 100);
    }
}
