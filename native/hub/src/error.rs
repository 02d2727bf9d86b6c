use thiserror::Error;

/// Failures surfaced by provisioning operations.
///
/// Every public [`crate::provision::Provisioner`] action has already logged and (where
/// applicable) notified about the error by the time it returns one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("No device connected")]
    NotConnected,
    #[error("No device selected")]
    NoDeviceSelected,
    #[error("Device transport unavailable: {0}")]
    TransportUnsupported(String),
    #[error("Device authentication failed: {0}")]
    AuthenticationFailed(String),
    /// The transport failed to deliver a command or a file.
    #[error("Command execution failed: {0}")]
    CommandExecutionFailed(String),
    /// The command ran but its output reports a failure.
    #[error("Device rejected the operation: {0}")]
    OperationRejectedByDevice(String),
    #[error("Another operation is already in progress")]
    Busy,
    #[error("Operation was not confirmed")]
    Declined,
    #[error("Invalid APK payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ProvisionError {
    /// Wraps a transport-level failure, keeping the full context chain in the message.
    pub(crate) fn execution(error: anyhow::Error) -> Self {
        Self::CommandExecutionFailed(format!("{error:#}"))
    }
}
