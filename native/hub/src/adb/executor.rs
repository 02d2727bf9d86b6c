use std::sync::Arc;

use derive_more::Debug;
use tracing::{instrument, trace};

use super::transport::Session;
use crate::error::ProvisionError;

/// Runs shell commands on the active session, if there is one
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    #[debug(skip)]
    session: Option<Arc<dyn Session>>,
}

impl CommandExecutor {
    pub fn new(session: Option<Arc<dyn Session>>) -> Self {
        Self { session }
    }

    pub(crate) fn session(&self) -> Result<&Arc<dyn Session>, ProvisionError> {
        self.session.as_ref().ok_or(ProvisionError::NotConnected)
    }

    /// Executes a command and returns its trimmed output.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn execute(&self, command: &str) -> Result<String, ProvisionError> {
        let output = self
            .session()?
            .execute_command(command)
            .await
            .map_err(|e| ProvisionError::execution(e.context(format!("'{command}' failed"))))?;
        trace!(output, "Shell command executed");
        Ok(output.trim().to_string())
    }

    /// Executes a command and hands its trimmed output to `classify`.
    pub async fn execute_classified<T>(
        &self,
        command: &str,
        classify: impl FnOnce(&str) -> T,
    ) -> Result<T, ProvisionError> {
        let output = self.execute(command).await?;
        Ok(classify(&output))
    }
}
