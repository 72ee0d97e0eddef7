pub mod async_result;
pub mod batch;
pub mod pipeline;
pub mod powershell;
pub mod remote;
pub mod runspace;
pub mod state;
pub mod streams;
mod worker;

#[cfg(test)]
mod tests;

pub use async_result::{AsyncResult, AsyncResultKind};
pub use batch::ErrorAction;
pub use pipeline::{Parameter, Pipeline, PipelineCommand, PipelineSpec, PsValue};
pub use powershell::{InvocationSettings, PowerShell, PowerShellConfig};
pub use state::{PsInvocationState, PsInvocationStateInfo};
pub use streams::{DataStream, ErrorRecord, PsDataStreams};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PwshInvokeError {
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Runspace error: {0}")]
    RunspaceError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Remote channel error: {0}")]
    RemoteError(String),

    #[error("Stop was requested")]
    StopRequested,

    #[error("Something unlikely happened: {0}")]
    UnlikelyToHappen(&'static str),
}

impl PwshInvokeError {
    /// Error kinds that are expected while tearing down resources that may
    /// already be gone. Teardown suppresses these; anything else is logged.
    pub(crate) fn is_teardown_benign(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_) | Self::InvalidArgument(_) | Self::StopRequested
        )
    }
}
