use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::pipeline::{PipelineCommand, PipelineSpec, PipelineStateHandler};
use crate::powershell::PsInstance;
use crate::state::{PsInvocationState, PsInvocationStateInfo};
use crate::streams::ErrorRecord;
use crate::worker::ExecutionWorker;
use crate::PwshInvokeError;

/// What to do with a statement failure inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorAction {
    #[default]
    Continue,
    SilentlyContinue,
    Stop,
    Inquire,
    Ignore,
}

/// How the statements of a batching invocation are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchMode {
    /// Statements are driven one at a time on this side.
    Local,
    /// The remote peer executes the whole statement list server-side.
    RemoteSingleShot,
}

/// Bookkeeping for one batching invocation. The original, unsplit command
/// list is kept so the instance's visible commands can be restored when the
/// batch ends, success or failure.
pub(crate) struct BatchState {
    pub statements: Vec<PipelineSpec>,
    pub next_index: usize,
    pub error_action: ErrorAction,
    pub original_commands: Vec<PipelineCommand>,
    pub mode: BatchMode,
}

impl BatchState {
    /// True while statements remain to be driven locally.
    pub fn has_remaining(&self) -> bool {
        self.mode == BatchMode::Local && self.next_index < self.statements.len()
    }
}

pub(crate) enum PolicyDecision {
    /// Move on to the next statement, optionally surfacing an error record.
    Continue { record: Option<ErrorRecord> },
    /// Abandon the remaining statements and finish with this state.
    Abort(PsInvocationStateInfo),
}

/// Evaluate the error-action policy against one statement's terminal state.
pub(crate) fn statement_policy(
    action: ErrorAction,
    outcome: &PsInvocationStateInfo,
) -> PolicyDecision {
    match outcome.state {
        PsInvocationState::Failed => {
            // a stop request aborts no matter what the policy says
            if matches!(outcome.reason, Some(PwshInvokeError::StopRequested)) {
                return PolicyDecision::Abort(PsInvocationStateInfo::new(
                    PsInvocationState::Stopped,
                ));
            }
            match action {
                ErrorAction::Stop | ErrorAction::Inquire => {
                    PolicyDecision::Abort(outcome.clone())
                }
                ErrorAction::Ignore => PolicyDecision::Continue { record: None },
                ErrorAction::Continue | ErrorAction::SilentlyContinue => {
                    let record = outcome.reason.as_ref().map(ErrorRecord::from);
                    PolicyDecision::Continue { record }
                }
            }
        }
        PsInvocationState::Stopped => PolicyDecision::Abort(outcome.clone()),
        _ => PolicyDecision::Continue { record: None },
    }
}

/// One locally-driven sub-statement: the sub-pipeline paired with the shared
/// rendezvous the driving callback blocks on.
pub(crate) struct BatchInvocationContext {
    pub spec: PipelineSpec,
    pub done: crossbeam::channel::Sender<PsInvocationStateInfo>,
}

impl PsInstance {
    /// The driving callback of a local batch: run the remaining statements
    /// one at a time. Each statement is handed to a spawned thread that
    /// invokes it synchronously and signals the rendezvous; invoking a
    /// sub-pipeline directly from a completion callback can block that
    /// callback's thread indefinitely, so every hop is rescheduled.
    pub(crate) fn drive_remaining_statements(self: &Arc<Self>) {
        loop {
            let next = {
                let mut core = self.core_lock();
                let Some(batch) = core.batch.as_mut() else {
                    return;
                };
                if batch.next_index >= batch.statements.len() {
                    None
                } else {
                    let spec = batch.statements[batch.next_index].clone();
                    batch.next_index += 1;
                    Some((spec, batch.error_action, batch.next_index))
                }
            };

            let Some((spec, error_action, index)) = next else {
                break;
            };
            debug!(statement = index, "driving next batch statement");

            let (done_tx, done_rx) = crossbeam::channel::bounded(1);
            let context = BatchInvocationContext {
                spec,
                done: done_tx,
            };
            let runner = Arc::clone(self);
            std::thread::spawn(move || runner.run_batch_statement(context));

            let outcome = done_rx.recv().unwrap_or_else(|_| {
                PsInvocationStateInfo::with_reason(
                    PsInvocationState::Failed,
                    PwshInvokeError::UnlikelyToHappen(
                        "batch statement finished without reporting a state",
                    ),
                )
            });

            match statement_policy(error_action, &outcome) {
                PolicyDecision::Continue { record } => {
                    if let Some(record) = record {
                        let error_stream = self.core_lock().io.data.error.clone();
                        if let Err(error) = error_stream.write(record) {
                            warn!(%error, "could not surface batch statement error");
                        }
                    }
                }
                PolicyDecision::Abort(final_info) => {
                    info!(
                        state = final_info.state.name(),
                        "aborting remaining batch statements"
                    );
                    self.set_state_changed(final_info);
                    return;
                }
            }
        }

        // every statement ran to a policy-accepted end
        self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Completed));
    }

    /// Thread-pool body for one driven statement: invoke it synchronously
    /// and report its terminal state through the rendezvous.
    fn run_batch_statement(self: &Arc<Self>, context: BatchInvocationContext) {
        let BatchInvocationContext { spec, done } = context;

        // a stop that lands between statements wins before the next one starts
        if self.stop_pending() {
            let _ = done.send(PsInvocationStateInfo::new(PsInvocationState::Stopped));
            return;
        }

        let sent = Arc::new(AtomicBool::new(false));
        let handler: PipelineStateHandler = {
            let done = done.clone();
            let sent = Arc::clone(&sent);
            Arc::new(move |info: PsInvocationStateInfo| {
                if info.state.is_terminal() && !sent.swap(true, Ordering::SeqCst) {
                    let _ = done.send(info);
                }
            })
        };

        // a remote peer without server-side batching gets one statement at a
        // time over the channel
        if let Some(channel) = self.remote_channel() {
            channel.set_state_changed(Some(handler));
            if let Err(error) = channel.invoke_async(std::slice::from_ref(&spec)) {
                if !sent.swap(true, Ordering::SeqCst) {
                    let _ = done.send(PsInvocationStateInfo::with_reason(
                        PsInvocationState::Failed,
                        error,
                    ));
                }
            }
            return;
        }

        let (binding, io, settings) = match self.worker_inputs() {
            Ok(inputs) => inputs,
            Err(error) => {
                let _ = done.send(PsInvocationStateInfo::with_reason(
                    PsInvocationState::Failed,
                    error,
                ));
                return;
            }
        };

        let worker = ExecutionWorker::new(true, spec, io, settings, binding, handler);
        self.install_worker(&worker);
        if let Err(error) = worker.run() {
            if !sent.swap(true, Ordering::SeqCst) {
                let _ = done.send(PsInvocationStateInfo::with_reason(
                    PsInvocationState::Failed,
                    error,
                ));
            }
        }
        // the shared streams stay open for the statements still to come
        worker.release(false);
        self.uninstall_worker(&worker);
    }
}
