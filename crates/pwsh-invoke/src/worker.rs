use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::pipeline::{Pipeline, PipelineSpec, PipelineStateHandler};
use crate::powershell::InvocationSettings;
use crate::runspace::{
    ApartmentState, PipelineIo, Runspace, RunspaceFactory, RunspacePool, RunspaceState,
    RunspaceTicket,
};
use crate::state::{PsInvocationState, PsInvocationStateInfo};
use crate::PwshInvokeError;

/// Where this worker gets its runspace from.
pub(crate) enum WorkerBinding {
    /// A runspace the caller explicitly assigned; left open on release.
    Assigned(Arc<dyn Runspace>),
    /// Borrow one from a shared pool; returned on release.
    Pool(Arc<dyn RunspacePool>),
    /// Create one on demand; closed on release.
    Factory(RunspaceFactory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStage {
    Idle,
    AcquiringRunspace,
    ConstructingPipeline,
    Running,
    Terminated,
}

impl WorkerStage {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AcquiringRunspace => "AcquiringRunspace",
            Self::ConstructingPipeline => "ConstructingPipeline",
            Self::Running => "Running",
            Self::Terminated => "Terminated",
        }
    }
}

enum RunspaceDisposal {
    LeaveOpen,
    CloseOnRelease,
    ReturnToPool,
}

struct AcquiredRunspace {
    runspace: Arc<dyn Runspace>,
    disposal: RunspaceDisposal,
}

/// Per-invocation coordinator between "a command list and a desired
/// resource" and "a pipeline actually running".
///
/// The `inactive` latch is the cooperative-cancellation flag: once set, later
/// completions of runspace acquisition or pipeline construction are
/// discarded instead of resurrecting an invocation that is conceptually
/// already stopped.
pub(crate) struct ExecutionWorker {
    sync_invoke: bool,
    spec: PipelineSpec,
    io: PipelineIo,
    settings: InvocationSettings,
    binding: WorkerBinding,
    events: PipelineStateHandler,
    stage: Mutex<WorkerStage>,
    inactive: AtomicBool,
    ticket: Mutex<Option<RunspaceTicket>>,
    runspace: Mutex<Option<AcquiredRunspace>>,
    pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
    released: AtomicBool,
}

impl ExecutionWorker {
    pub(crate) fn new(
        sync_invoke: bool,
        spec: PipelineSpec,
        io: PipelineIo,
        settings: InvocationSettings,
        binding: WorkerBinding,
        events: PipelineStateHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync_invoke,
            spec,
            io,
            settings,
            binding,
            events,
            stage: Mutex::new(WorkerStage::Idle),
            inactive: AtomicBool::new(false),
            ticket: Mutex::new(None),
            runspace: Mutex::new(None),
            pipeline: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    fn set_stage(&self, stage: WorkerStage) {
        debug!(stage = stage.name(), "worker stage");
        *self.stage.lock().unwrap() = stage;
    }

    /// Acquire a runspace, construct the pipeline and start execution.
    ///
    /// For a synchronous invocation this blocks through pipeline completion
    /// and returns any acquisition, construction or execution failure to the
    /// calling thread. For an asynchronous one it returns once execution (or
    /// a pending pool acquisition) is underway.
    pub(crate) fn run(self: &Arc<Self>) -> Result<(), PwshInvokeError> {
        // a stop that arrived before launch has already reported Stopped;
        // acquiring anything now would only have to be handed straight back
        if self.inactive.load(Ordering::SeqCst) {
            return Ok(());
        }
        match &self.binding {
            WorkerBinding::Assigned(runspace) => {
                self.start_with_runspace(Arc::clone(runspace), RunspaceDisposal::LeaveOpen)
            }
            WorkerBinding::Factory(factory) => {
                self.set_stage(WorkerStage::AcquiringRunspace);
                let runspace = factory()?;
                self.start_with_runspace(runspace, RunspaceDisposal::CloseOnRelease)
            }
            WorkerBinding::Pool(pool) => {
                self.set_stage(WorkerStage::AcquiringRunspace);
                if self.sync_invoke {
                    let ticket = pool.begin_get_runspace(Arc::new(|_| {}))?;
                    *self.ticket.lock().unwrap() = Some(ticket);
                    let acquired = pool.end_get_runspace(ticket);
                    self.ticket.lock().unwrap().take();
                    let runspace = acquired?;
                    if self.inactive.load(Ordering::SeqCst) {
                        pool.release_runspace(runspace);
                        return Ok(());
                    }
                    self.start_with_runspace(runspace, RunspaceDisposal::ReturnToPool)
                } else {
                    let worker = Arc::clone(self);
                    let ticket = pool.begin_get_runspace(Arc::new(move |ticket| {
                        worker.on_runspace_ready(ticket);
                    }))?;
                    *self.ticket.lock().unwrap() = Some(ticket);
                    // a stop that raced the begin call cancels the
                    // acquisition it did not yet know about
                    if self.inactive.load(Ordering::SeqCst) {
                        pool.cancel_get_runspace(ticket);
                    }
                    Ok(())
                }
            }
        }
    }

    /// Detached variant for asynchronous invocations: setup failures become
    /// a synthetic `Failed` notification instead of being lost.
    pub(crate) fn run_async_detached(self: Arc<Self>) {
        std::thread::spawn(move || {
            if let Err(error) = self.run() {
                warn!(%error, "asynchronous invocation setup failed");
                (self.events)(PsInvocationStateInfo::with_reason(
                    PsInvocationState::Failed,
                    error,
                ));
            }
        });
    }

    /// Pool acquisition completion for the asynchronous path.
    fn on_runspace_ready(self: &Arc<Self>, ticket: RunspaceTicket) {
        let WorkerBinding::Pool(pool) = &self.binding else {
            return;
        };
        self.ticket.lock().unwrap().take();

        let runspace = match pool.end_get_runspace(ticket) {
            Ok(runspace) => runspace,
            Err(error) => {
                // a cancelled acquisition is the stop path doing its job
                if !self.inactive.load(Ordering::SeqCst) {
                    (self.events)(PsInvocationStateInfo::with_reason(
                        PsInvocationState::Failed,
                        error,
                    ));
                }
                return;
            }
        };

        if self.inactive.load(Ordering::SeqCst) {
            // stopped while the acquisition was in flight
            pool.release_runspace(runspace);
            return;
        }

        if let Err(error) = self.start_with_runspace(runspace, RunspaceDisposal::ReturnToPool) {
            (self.events)(PsInvocationStateInfo::with_reason(
                PsInvocationState::Failed,
                error,
            ));
        }
    }

    fn start_with_runspace(
        self: &Arc<Self>,
        runspace: Arc<dyn Runspace>,
        disposal: RunspaceDisposal,
    ) -> Result<(), PwshInvokeError> {
        // threading-model precondition, checked before any work starts
        let requested = self.settings.apartment_state;
        let enforced = runspace.apartment_state();
        if requested != ApartmentState::Unknown
            && enforced != ApartmentState::Unknown
            && requested != enforced
        {
            return Err(PwshInvokeError::InvalidState(
                "requested apartment state does not match the runspace threading policy",
            ));
        }

        if runspace.state() == RunspaceState::BeforeOpen {
            runspace.open()?;
        }
        if runspace.state() != RunspaceState::Opened {
            return Err(PwshInvokeError::RunspaceError(format!(
                "runspace {} is not opened",
                runspace.id()
            )));
        }

        *self.runspace.lock().unwrap() = Some(AcquiredRunspace {
            runspace: Arc::clone(&runspace),
            disposal,
        });
        if self.inactive.load(Ordering::SeqCst) {
            // the stop already reported; do not construct a pipeline for it
            return Ok(());
        }

        self.set_stage(WorkerStage::ConstructingPipeline);
        let pipeline = runspace.create_pipeline(&self.spec, &self.io)?;
        pipeline.set_state_changed(Some(Arc::clone(&self.events)));
        *self.pipeline.lock().unwrap() = Some(Arc::clone(&pipeline));

        if self.inactive.load(Ordering::SeqCst) {
            // stop raced pipeline construction; stop the fresh pipeline
            if let Err(error) = pipeline.stop_async() {
                warn!(%error, "could not stop freshly constructed pipeline");
            }
            return Ok(());
        }

        self.set_stage(WorkerStage::Running);
        if self.sync_invoke {
            pipeline.invoke()
        } else {
            pipeline.invoke_async()
        }
    }

    /// Mediate a stop that may race runspace acquisition or pipeline
    /// construction. With a live pipeline the stop is forwarded; with only a
    /// pending acquisition the acquisition is cancelled; with neither, a
    /// `Stopped` notification is synthesized, inline for a synchronous
    /// stop and on a separate thread for an asynchronous one so the caller
    /// is never blocked inside event-handler code it does not control.
    pub(crate) fn stop(&self, sync: bool) {
        self.inactive.store(true, Ordering::SeqCst);

        let pipeline = self.pipeline.lock().unwrap().clone();
        if let Some(pipeline) = pipeline {
            let stopped = if sync {
                pipeline.stop()
            } else {
                pipeline.stop_async()
            };
            if let Err(error) = stopped {
                warn!(%error, "pipeline stop failed");
            }
            return;
        }

        let ticket = self.ticket.lock().unwrap().take();
        if let (Some(ticket), WorkerBinding::Pool(pool)) = (ticket, &self.binding) {
            debug!(ticket = %ticket.id(), "cancelling pending runspace acquisition");
            pool.cancel_get_runspace(ticket);
        }

        // nothing exists to forward the stop to; report it directly
        let events = Arc::clone(&self.events);
        let synthesize =
            move || events(PsInvocationStateInfo::new(PsInvocationState::Stopped));
        if sync {
            synthesize();
        } else {
            std::thread::spawn(synthesize);
        }
    }

    /// Tear down this worker's resources. Never throws: teardown-time
    /// failures of the benign already-gone kinds are swallowed, the rest
    /// are logged.
    ///
    /// `close_streams` is false when later batch statements still share the
    /// invocation's streams.
    pub(crate) fn release(&self, close_streams: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_stage(WorkerStage::Terminated);

        if close_streams {
            self.io.close_internal();
        }

        if let Some(pipeline) = self.pipeline.lock().unwrap().take() {
            // detach before dropping so teardown never re-enters the owner
            pipeline.set_state_changed(None);
            drop(pipeline);
        }

        if let Some(AcquiredRunspace { runspace, disposal }) =
            self.runspace.lock().unwrap().take()
        {
            match disposal {
                RunspaceDisposal::LeaveOpen => {}
                RunspaceDisposal::CloseOnRelease => {
                    if let Err(error) = runspace.close() {
                        if error.is_teardown_benign() {
                            debug!(%error, "ignoring benign teardown error");
                        } else {
                            warn!(%error, "runspace close failed during teardown");
                        }
                    }
                }
                RunspaceDisposal::ReturnToPool => {
                    if let WorkerBinding::Pool(pool) = &self.binding {
                        pool.release_runspace(runspace);
                    }
                }
            }
        }
    }
}
