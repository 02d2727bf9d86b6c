//! Chunked APK upload followed by the remote install and cleanup.
//!
//! Progress is reported on a 0-100 scale: the upload covers 0-80, then fixed checkpoints
//! follow at 85 (install started), 95 (install returned) and 100 (temp file removed). Every
//! job that starts uploading ends at 100, whatever the outcome.

use std::{io::Cursor, path::Path, sync::Arc};

use humansize::{DECIMAL, format_size};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, BufReader},
};
use tracing::{debug, error, info, instrument, warn};

use super::{
    commands::{CLEANUP_COMMAND, INSTALL_COMMAND, REMOTE_APK_PATH, Verdict, classify_install},
    executor::CommandExecutor,
    transport::Session,
};
use crate::{
    error::ProvisionError,
    models::signals::provision::{TransferProgress, TransferStage},
};

pub const UPLOAD_CHUNK_SIZE: usize = 65536;

const UPLOAD_SHARE: u64 = 80;
const INSTALL_STARTED_PERCENT: u8 = 85;
const INSTALL_FINISHED_PERCENT: u8 = 95;
const DONE_PERCENT: u8 = 100;

/// APK bytes to push, with their declared length
pub struct ApkPayload {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    total_bytes: u64,
}

impl std::fmt::Debug for ApkPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApkPayload").field("total_bytes", &self.total_bytes).finish_non_exhaustive()
    }
}

impl ApkPayload {
    #[instrument(level = "debug", err)]
    pub async fn from_path(path: &Path) -> Result<Self, ProvisionError> {
        let file = File::open(path).await.map_err(|e| {
            ProvisionError::InvalidPayload(format!("Failed to open {}: {e}", path.display()))
        })?;
        let metadata = file.metadata().await.map_err(|e| {
            ProvisionError::InvalidPayload(format!("Failed to read metadata of {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(ProvisionError::InvalidPayload(format!(
                "{} is not a file",
                path.display()
            )));
        }
        Ok(Self { reader: Box::new(BufReader::new(file)), total_bytes: metadata.len() })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let total_bytes = bytes.len() as u64;
        Self { reader: Box::new(Cursor::new(bytes)), total_bytes }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Progress bookkeeping of one install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferJob {
    pub total_bytes: u64,
    pub bytes_sent: u64,
    pub progress_percent: u8,
}

impl TransferJob {
    fn new(total_bytes: u64) -> Self {
        Self { total_bytes, bytes_sent: 0, progress_percent: 0 }
    }

    fn record_chunk(&mut self, len: usize) -> TransferProgress {
        self.bytes_sent += len as u64;
        let percent = (self.bytes_sent.min(self.total_bytes) * UPLOAD_SHARE / self.total_bytes) as u8;
        self.advance(percent, TransferStage::Uploading)
    }

    /// Moves forward to `percent`; progress never goes back
    fn advance(&mut self, percent: u8, stage: TransferStage) -> TransferProgress {
        self.progress_percent = self.progress_percent.max(percent);
        TransferProgress { percent: self.progress_percent, stage }
    }
}

/// Fills `buf` unless the reader ends first; returns the number of bytes read.
async fn read_chunk(reader: &mut (impl AsyncRead + Unpin), buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn upload(
    session: &Arc<dyn Session>,
    payload: ApkPayload,
    job: &mut TransferJob,
    on_progress: &mut (impl FnMut(TransferProgress) + Send),
) -> Result<(), ProvisionError> {
    let mut sink = session
        .open_upload_channel(REMOTE_APK_PATH)
        .await
        .map_err(|e| ProvisionError::execution(e.context("Failed to open sync channel")))?;

    let mut reader = payload.reader.take(job.total_bytes);
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let n = read_chunk(&mut reader, &mut buf)
            .await
            .map_err(|e| ProvisionError::InvalidPayload(format!("Failed to read APK: {e}")))?;
        if n == 0 {
            break;
        }
        sink.write_chunk(&buf[..n])
            .await
            .map_err(|e| ProvisionError::execution(e.context("Upload interrupted")))?;
        on_progress(job.record_chunk(n));
    }

    if job.bytes_sent != job.total_bytes {
        return Err(ProvisionError::InvalidPayload(format!(
            "APK ended after {} of {} bytes",
            job.bytes_sent, job.total_bytes
        )));
    }
    sink.dispose().await.map_err(|e| ProvisionError::execution(e.context("Failed to finish upload")))
}

/// Pushes `payload` to [`REMOTE_APK_PATH`], installs it and removes the temp file.
///
/// The temp file is removed whatever happened before, and progress always ends at 100 once
/// the upload has started. Upload errors are not retried.
#[instrument(skip(executor, on_progress), err)]
pub async fn push_and_install(
    executor: &CommandExecutor,
    payload: ApkPayload,
    mut on_progress: impl FnMut(TransferProgress) + Send,
) -> Result<(), ProvisionError> {
    if payload.total_bytes == 0 {
        return Err(ProvisionError::InvalidPayload("APK is empty".to_string()));
    }
    let session = executor.session()?.clone();
    let mut job = TransferJob::new(payload.total_bytes);
    info!(size = %format_size(job.total_bytes, DECIMAL), "Uploading APK");
    on_progress(job.advance(0, TransferStage::Uploading));

    let outcome = match upload(&session, payload, &mut job, &mut on_progress).await {
        Ok(()) => {
            debug!(bytes = job.bytes_sent, "Upload finished, installing");
            on_progress(job.advance(INSTALL_STARTED_PERCENT, TransferStage::Installing));
            let result = executor.execute(INSTALL_COMMAND).await;
            on_progress(job.advance(INSTALL_FINISHED_PERCENT, TransferStage::CleaningUp));
            match result {
                Ok(output) => match classify_install(&output) {
                    Verdict::Success => Ok(()),
                    Verdict::Failure => Err(ProvisionError::OperationRejectedByDevice(output)),
                },
                Err(e) => Err(e),
            }
        }
        Err(e) => {
            error!(error = &e as &dyn std::error::Error, sent = job.bytes_sent, "Upload aborted");
            Err(e)
        }
    };

    if let Err(e) = executor.execute(CLEANUP_COMMAND).await {
        warn!(error = &e as &dyn std::error::Error, "Failed to remove temporary APK");
    }
    on_progress(job.advance(DONE_PERCENT, TransferStage::Finished));
    outcome
}
