use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProvisionError;

/// Source of device sessions.
///
/// Device selection and the authentication handshake happen behind this seam; the
/// implementation owns whatever credential store the handshake needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Selects a device, connects and authenticates.
    ///
    /// Fails with [`ProvisionError::NoDeviceSelected`], [`ProvisionError::TransportUnsupported`]
    /// or [`ProvisionError::AuthenticationFailed`].
    async fn connect(&self) -> Result<Arc<dyn Session>, ProvisionError>;
}

/// An authenticated connection to a single device
#[async_trait]
pub trait Session: Send + Sync {
    /// Transport-level serial of the device
    fn serial(&self) -> &str;

    /// Runs a shell command to completion and returns its raw output (stdout and stderr merged).
    async fn execute_command(&self, command: &str) -> Result<String>;

    /// Opens a sync channel that writes a file at `remote_path`.
    async fn open_upload_channel(&self, remote_path: &str) -> Result<Box<dyn UploadSink>>;

    /// Cancelled exactly once when the session ends, whether by [`Session::close`] or because
    /// the device went away.
    fn disconnected(&self) -> CancellationToken;

    /// Releases the session. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Sequential byte sink for a file being pushed to the device
#[async_trait]
pub trait UploadSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Flushes and closes the channel, reporting whether the remote file was written.
    async fn dispose(self: Box<Self>) -> Result<()>;
}
