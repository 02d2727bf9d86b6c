use std::{error::Error, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use derive_more::Debug;
use forensic_adb::{DeviceState, UnixPathBuf};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    process::Command,
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{self, timeout},
};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, instrument, trace, warn};

use super::{
    transfer::UPLOAD_CHUNK_SIZE,
    transport::{Session, Transport, UploadSink},
};
use crate::{error::ProvisionError, models::Settings, utils::resolve_binary_path};

const TRACKER_RESTART_DELAY: Duration = Duration::from_secs(1);
/// Device tracking streams in a row that fail before any update; the session is lost after that
const TRACKER_MAX_FAILED_STARTS: u32 = 3;
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);
const PUSHED_FILE_MODE: u32 = 0o644;

/// [`Transport`] backed by the local ADB host server.
///
/// The server owns the RSA key store and performs the authentication handshake with the
/// device, so a device that has not accepted the host key shows up as unauthorized.
#[derive(Debug)]
pub struct AdbHostTransport {
    adb_host: forensic_adb::Host,
    /// ADB server check/start mutex
    adb_server_mutex: Mutex<()>,
    adb_path: RwLock<Option<String>>,
    preferred_serial: RwLock<Option<String>>,
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

impl AdbHostTransport {
    /// Creates the transport and keeps it in sync with settings updates
    #[instrument(skip(settings_stream))]
    pub async fn new(mut settings_stream: WatchStream<Settings>) -> Arc<Self> {
        let settings = settings_stream.next().await.unwrap_or_default();
        let handle = Arc::new(Self {
            adb_host: if cfg!(target_os = "windows") {
                // Connecting through the default host fails on Windows
                forensic_adb::Host { host: Some("127.0.0.1".to_string()), port: Some(5037) }
            } else {
                forensic_adb::Host::default()
            },
            adb_server_mutex: Mutex::new(()),
            adb_path: RwLock::new(non_empty(settings.adb_path)),
            preferred_serial: RwLock::new(non_empty(settings.preferred_serial)),
        });

        tokio::spawn(
            {
                let handle = Arc::downgrade(&handle);
                async move {
                    while let Some(settings) = settings_stream.next().await {
                        let Some(handle) = handle.upgrade() else { break };
                        let adb_path = non_empty(settings.adb_path);
                        if adb_path != *handle.adb_path.read().await {
                            info!(?adb_path, "ADB path changed");
                            *handle.adb_path.write().await = adb_path;
                        }
                        *handle.preferred_serial.write().await =
                            non_empty(settings.preferred_serial);
                    }
                    debug!("Settings stream closed for AdbHostTransport");
                }
            }
            .instrument(info_span!("task_handle_settings_updates")),
        );

        handle
    }

    /// Ensures the ADB server is running, starting it if necessary
    #[instrument(skip(self), err)]
    async fn ensure_server_running(&self) -> Result<()> {
        let _guard = self.adb_server_mutex.lock().await;
        if self.is_server_running().await {
            return Ok(());
        }

        info!("ADB server not running, attempting to start it");
        let adb_path = resolve_binary_path(self.adb_path.read().await.as_deref(), "adb")
            .context("ADB binary not found")?;
        info!(path = %adb_path.display(), "Found ADB binary, starting server");

        let output = timeout(SERVER_START_TIMEOUT, {
            let mut command = Command::new(&adb_path);
            command.arg("start-server");
            #[cfg(target_os = "windows")]
            // CREATE_NO_WINDOW
            command.creation_flags(0x08000000);
            command.output()
        })
        .await
        .map_err(|_| anyhow!("Timed out while starting ADB server"))?
        .context("Failed to start ADB server")?;

        if !output.status.success() {
            bail!("Failed to start ADB server: {}", String::from_utf8_lossy(&output.stderr));
        }
        info!("ADB server started successfully");
        Ok(())
    }

    #[instrument(skip(self), level = "debug", ret)]
    async fn is_server_running(&self) -> bool {
        match timeout(Duration::from_millis(1000), self.adb_host.check_host_running()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = &e as &dyn Error, "ADB server check failed");
                false
            }
            Err(_) => {
                debug!("Timed out while checking ADB server status (likely not running)");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for AdbHostTransport {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<Arc<dyn Session>, ProvisionError> {
        self.ensure_server_running()
            .await
            .map_err(|e| ProvisionError::TransportUnsupported(format!("{e:#}")))?;

        let devices = self
            .adb_host
            .devices::<Vec<_>>()
            .await
            .map_err(|e| ProvisionError::TransportUnsupported(format!("Failed to list devices: {e}")))?;
        debug!(count = devices.len(), "Listed ADB devices");

        let preferred = self.preferred_serial.read().await.clone();
        let ready = devices.iter().filter(|d| d.state == DeviceState::Device).collect::<Vec<_>>();
        let selected = preferred
            .as_deref()
            .and_then(|serial| ready.iter().find(|d| d.serial == serial))
            .or_else(|| ready.first());

        let Some(selected) = selected else {
            if devices.iter().any(|d| d.state == DeviceState::Unauthorized) {
                return Err(ProvisionError::AuthenticationFailed(
                    "Device is unauthorized, accept the USB debugging prompt on the device"
                        .to_string(),
                ));
            }
            return Err(ProvisionError::NoDeviceSelected);
        };
        info!(serial = %selected.serial, "Selected device, connecting");

        let device = forensic_adb::Device::new(
            self.adb_host.clone(),
            selected.serial.clone(),
            selected.info.clone(),
        )
        .await
        .map_err(|e| {
            ProvisionError::TransportUnsupported(format!(
                "Failed to open device {}: {e}",
                selected.serial
            ))
        })?;

        Ok(AdbSession::start(self.adb_host.clone(), device))
    }
}

/// Session with one device through the ADB host server
#[derive(Debug)]
pub struct AdbSession {
    #[debug(skip)]
    device: forensic_adb::Device,
    serial: String,
    disconnected: CancellationToken,
}

impl AdbSession {
    fn start(adb_host: forensic_adb::Host, device: forensic_adb::Device) -> Arc<Self> {
        let serial = device.serial.clone();
        let disconnected = CancellationToken::new();
        tokio::spawn(
            {
                let serial = serial.clone();
                let token = disconnected.clone();
                async move {
                    token.run_until_cancelled(watch_presence(&adb_host, &serial)).await;
                    token.cancel();
                }
            }
            .instrument(info_span!("task_watch_device", serial = %serial)),
        );
        Arc::new(Self { device, serial, disconnected })
    }
}

/// Whether `serial` is among the listed devices and ready for commands
fn still_present<'a>(
    devices: impl IntoIterator<Item = (&'a str, &'a DeviceState)>,
    serial: &str,
) -> bool {
    devices.into_iter().any(|(s, state)| s == serial && *state == DeviceState::Device)
}

/// Returns once the device has left the `device` state or device tracking cannot be restarted.
async fn watch_presence(adb_host: &forensic_adb::Host, serial: &str) {
    let mut failed_starts = 0;
    loop {
        debug!("Starting track_devices stream");
        let stream = adb_host.track_devices();
        tokio::pin!(stream);
        let mut got_update = false;

        while let Some(update) = stream.next().await {
            match update {
                Ok(devices) => {
                    got_update = true;
                    failed_starts = 0;
                    if !still_present(devices.iter().map(|d| (d.serial.as_str(), &d.state)), serial)
                    {
                        info!("Device missing from device list or not in \"device\" state");
                        return;
                    }
                    trace!("Device still present");
                }
                Err(e) => {
                    // Server might have died
                    warn!(
                        error = &e as &dyn Error,
                        got_update,
                        "track_devices stream failed, restarting"
                    );
                    break;
                }
            }
        }

        if !got_update {
            failed_starts += 1;
            if failed_starts >= TRACKER_MAX_FAILED_STARTS {
                error!("ADB server unreachable, dropping session");
                return;
            }
        }
        time::sleep(TRACKER_RESTART_DELAY).await;
    }
}

#[async_trait]
impl Session for AdbSession {
    fn serial(&self) -> &str {
        &self.serial
    }

    #[instrument(level = "debug", skip(self), fields(serial = %self.serial), err)]
    async fn execute_command(&self, command: &str) -> Result<String> {
        if self.disconnected.is_cancelled() {
            bail!("Device {} is disconnected", self.serial);
        }
        self.device
            .execute_host_shell_command(command)
            .await
            .context("Failed to execute shell command")
    }

    #[instrument(level = "debug", skip(self), fields(serial = %self.serial), err)]
    async fn open_upload_channel(&self, remote_path: &str) -> Result<Box<dyn UploadSink>> {
        if self.disconnected.is_cancelled() {
            bail!("Device {} is disconnected", self.serial);
        }
        let (writer, mut reader) = tokio::io::duplex(UPLOAD_CHUNK_SIZE);
        let device = self.device.clone();
        let remote_path = UnixPathBuf::from(remote_path);
        let push = tokio::spawn(
            async move {
                device
                    .push(&mut reader, &remote_path, PUSHED_FILE_MODE)
                    .await
                    .with_context(|| format!("Failed to push {}", remote_path.display()))
            }
            .instrument(Span::current()),
        );
        Ok(Box::new(SyncUpload { writer, push: Some(push) }))
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn close(&self) -> Result<()> {
        if !self.disconnected.is_cancelled() {
            debug!(serial = %self.serial, "Closing device session");
            self.disconnected.cancel();
        }
        Ok(())
    }
}

/// Sync channel fed through an in-memory pipe into a background `push`
struct SyncUpload {
    writer: DuplexStream,
    push: Option<JoinHandle<Result<()>>>,
}

#[async_trait]
impl UploadSink for SyncUpload {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write_all(chunk).await.context("Sync channel closed unexpectedly")
    }

    async fn dispose(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let push = this.push.take().context("Upload already disposed")?;
        this.writer.shutdown().await.context("Failed to close sync channel")?;
        drop(this);
        push.await.context("Push task failed")?
    }
}

impl Drop for SyncUpload {
    fn drop(&mut self) {
        // Not disposed: the upload was abandoned, don't let a truncated file land on the device
        if let Some(push) = self.push.take() {
            push.abort();
        }
    }
}
