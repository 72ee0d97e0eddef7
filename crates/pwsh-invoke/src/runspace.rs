use std::sync::Arc;

use uuid::Uuid;

use crate::pipeline::{Pipeline, PipelineSpec, PsValue};
use crate::remote::RemoteChannel;
use crate::streams::{DataStream, PsDataStreams};
use crate::PwshInvokeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspaceState {
    BeforeOpen,
    Opening,
    Opened,
    Closed,
    Closing,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspacePoolState {
    BeforeOpen,
    Opening,
    Opened,
    Closed,
    Closing,
    Broken,
    Connecting,
    Disconnected,
}

/// COM threading policy requested for (or enforced by) a runspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApartmentState {
    Sta,
    Mta,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsThreadOptions {
    #[default]
    Default,
    UseNewThread,
    ReuseThread,
    UseCurrentThread,
}

/// The streams a pipeline is bound to. Clones share the underlying buffers.
#[derive(Debug, Clone)]
pub struct PipelineIo {
    pub input: DataStream<PsValue>,
    pub output: DataStream<PsValue>,
    pub data: PsDataStreams,
}

impl PipelineIo {
    pub fn new() -> Self {
        Self {
            input: DataStream::new(),
            output: DataStream::new(),
            data: PsDataStreams::new(),
        }
    }

    /// Close the wrappers the instance owns. The output stream is handled
    /// separately because its ownership may have crossed to the caller.
    pub(crate) fn close_internal(&self) {
        self.input.close();
        self.data.close_all();
    }
}

impl Default for PipelineIo {
    fn default() -> Self {
        Self::new()
    }
}

/// The execution resource a pipeline runs against: conceptually one
/// interpreter session. Consumed, not implemented, by this crate.
pub trait Runspace: Send + Sync {
    fn id(&self) -> Uuid;

    fn state(&self) -> RunspaceState;

    fn open(&self) -> Result<(), PwshInvokeError>;

    fn close(&self) -> Result<(), PwshInvokeError>;

    /// The threading policy this runspace was created with. `Unknown` means
    /// no policy is enforced.
    fn apartment_state(&self) -> ApartmentState;

    /// Construct a pipeline bound to the given commands and streams.
    fn create_pipeline(
        &self,
        spec: &PipelineSpec,
        io: &PipelineIo,
    ) -> Result<Arc<dyn Pipeline>, PwshInvokeError>;
}

/// Handle for a pending asynchronous runspace acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunspaceTicket {
    pub(crate) id: Uuid,
}

impl RunspaceTicket {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

pub type RunspaceReadyHandler = Arc<dyn Fn(RunspaceTicket) + Send + Sync>;

/// A managed set of runspaces, possibly remote, from which one is borrowed
/// per invocation. Pools are shared across instances: the invocation engine
/// only ever returns a borrowed runspace, it never disposes the pool.
pub trait RunspacePool: Send + Sync {
    fn state(&self) -> RunspacePoolState;

    /// Bring a `Disconnected` pool back to `Opened`.
    fn connect(&self) -> Result<(), PwshInvokeError>;

    /// Start an asynchronous acquisition. `on_ready` fires once a runspace
    /// is available for the returned ticket.
    fn begin_get_runspace(
        &self,
        on_ready: RunspaceReadyHandler,
    ) -> Result<RunspaceTicket, PwshInvokeError>;

    /// Redeem a ticket, blocking until the runspace is available. Fails if
    /// the acquisition was cancelled.
    fn end_get_runspace(&self, ticket: RunspaceTicket) -> Result<Arc<dyn Runspace>, PwshInvokeError>;

    fn cancel_get_runspace(&self, ticket: RunspaceTicket);

    fn release_runspace(&self, runspace: Arc<dyn Runspace>);

    /// The remote channel behind this pool, when it fronts a remote peer.
    fn remote_channel(&self) -> Option<Arc<dyn RemoteChannel>> {
        None
    }
}

/// On-demand runspace creation for instances bound to neither a runspace nor
/// a pool.
pub type RunspaceFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Runspace>, PwshInvokeError> + Send + Sync>;
