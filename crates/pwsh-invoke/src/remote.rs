use uuid::Uuid;

use crate::pipeline::{PipelineSpec, PipelineStateHandler};
use crate::powershell::InvocationSettings;
use crate::runspace::PipelineIo;
use crate::PwshInvokeError;

/// Negotiated remoting protocol version of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    /// First protocol version with server-side batch execution.
    pub const BATCH_INVOCATION: Self = Self { major: 2, minor: 2 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether the peer accepts a whole statement list in one shot.
    pub fn supports_batch_invocation(self) -> bool {
        self >= Self::BATCH_INVOCATION
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Everything needed to reconstruct a client object for a still-running
/// remote command after the original channel was lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnectInfo {
    pub endpoint: String,
    pub shell_id: Uuid,
    pub command_id: Uuid,
}

/// The consumed remote-channel contract for a command running against a
/// remote peer. Wire format is not this crate's concern; only the
/// call/callback surface is.
pub trait RemoteChannel: Send + Sync {
    fn protocol_version(&self) -> ProtocolVersion;

    /// Bind the channel to this invocation's streams and settings. Must be
    /// called before `invoke_async` or `connect_async`.
    fn initialize(
        &self,
        io: &PipelineIo,
        settings: &InvocationSettings,
    ) -> Result<(), PwshInvokeError>;

    /// Start remote execution. Callers pass one statement normally, or the
    /// entire batch when `protocol_version().supports_batch_invocation()`.
    fn invoke_async(&self, statements: &[PipelineSpec]) -> Result<(), PwshInvokeError>;

    /// Reconnect to the remote command. `Some(connect_info)` reconstructs a
    /// client object for an existing command; `None` resumes over the
    /// channel's cached identity.
    fn connect_async(&self, connect_info: Option<&RemoteConnectInfo>)
        -> Result<(), PwshInvokeError>;

    fn stop_async(&self) -> Result<(), PwshInvokeError>;

    /// Pause delivery from the transport receive queue.
    fn suspend_receive(&self);

    /// Resume delivery from the transport receive queue.
    fn resume_receive(&self);

    /// Replace (or with `None`, detach) the command state subscription.
    fn set_state_changed(&self, handler: Option<PipelineStateHandler>);
}
