use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::async_result::{AsyncResult, AsyncResultCallback, AsyncResultKind};
use crate::batch::{BatchMode, BatchState, ErrorAction};
use crate::pipeline::{PipelineCommand, PipelineSpec, PipelineStateHandler, PsValue};
use crate::remote::{RemoteChannel, RemoteConnectInfo};
use crate::runspace::{
    ApartmentState, PipelineIo, Runspace, RunspaceFactory, RunspacePool, RunspacePoolState,
};
use crate::state::{
    InvocationStateMachine, PsInvocationState, PsInvocationStateInfo, StateChangedHandler,
};
use crate::streams::{DataStream, PsDataStreams};
use crate::worker::{ExecutionWorker, WorkerBinding};
use crate::PwshInvokeError;

/// Options for one invocation.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct InvocationSettings {
    #[builder(default)]
    pub apartment_state: ApartmentState,
    /// Per-invocation error-action policy between batch statements. `None`
    /// falls back to the instance's ambient preference.
    #[builder(default, setter(strip_option))]
    pub error_action: Option<ErrorAction>,
    #[builder(default)]
    pub add_to_history: bool,
}

/// Construction-time configuration of a [`PowerShell`] instance.
#[derive(TypedBuilder)]
pub struct PowerShellConfig {
    #[builder(default, setter(strip_option))]
    pub runspace: Option<Arc<dyn Runspace>>,
    #[builder(default, setter(strip_option))]
    pub runspace_pool: Option<Arc<dyn RunspacePool>>,
    #[builder(default, setter(strip_option))]
    pub runspace_factory: Option<RunspaceFactory>,
    #[builder(default)]
    pub error_action_preference: ErrorAction,
}

/// The execution resource this instance is bound to.
pub(crate) enum ResourceBinding {
    Unbound { factory: Option<RunspaceFactory> },
    Runspace(Arc<dyn Runspace>),
    Pool(Arc<dyn RunspacePool>),
}

/// Everything guarded by the single instance mutex: command list, buffers,
/// the active worker and the batch bookkeeping. The invocation state itself
/// lives in the state machine under its own, narrower lock.
pub(crate) struct InstanceCore {
    pub commands: Vec<PipelineCommand>,
    pub binding: ResourceBinding,
    pub io: PipelineIo,
    pub output_owned: bool,
    pub worker: Option<Arc<ExecutionWorker>>,
    pub invoke_result: Option<AsyncResult>,
    pub stop_result: Option<AsyncResult>,
    pub batch: Option<BatchState>,
    pub settings: InvocationSettings,
    pub sync_invoke: bool,
    pub error_action_preference: ErrorAction,
    pub remote_channel: Option<Arc<dyn RemoteChannel>>,
    pub connect_info: Option<RemoteConnectInfo>,
}

pub(crate) struct PsInstance {
    id: Uuid,
    state_machine: InvocationStateMachine,
    core: Mutex<InstanceCore>,
}

/// A command-pipeline host object: assemble a command, then drive it against
/// a borrowed runspace or pool synchronously, asynchronously or as a batch,
/// with cooperative stop and a disconnected/reconnect lifecycle for remote
/// resources.
#[derive(Clone)]
pub struct PowerShell {
    inner: Arc<PsInstance>,
}

enum InvokeRoute {
    LocalWorker { worker: Arc<ExecutionWorker> },
    LocalBatchInline,
    Remote {
        channel: Arc<dyn RemoteChannel>,
        statements: Vec<PipelineSpec>,
    },
}

impl PowerShell {
    pub fn new(config: PowerShellConfig) -> Self {
        let binding = if let Some(runspace) = config.runspace {
            ResourceBinding::Runspace(runspace)
        } else if let Some(pool) = config.runspace_pool {
            ResourceBinding::Pool(pool)
        } else {
            ResourceBinding::Unbound {
                factory: config.runspace_factory,
            }
        };
        Self::with_parts(
            binding,
            InvocationStateMachine::new(),
            config.error_action_preference,
            None,
        )
    }

    /// Construct a client object for a still-running remote command whose
    /// channel was lost. The instance starts in `Disconnected`; `connect`
    /// reconstructs (with `connect_info`) or resumes (without) it.
    pub fn attach_disconnected(
        pool: Arc<dyn RunspacePool>,
        connect_info: Option<RemoteConnectInfo>,
    ) -> Self {
        Self::with_parts(
            ResourceBinding::Pool(pool),
            InvocationStateMachine::starting_at(PsInvocationState::Disconnected),
            ErrorAction::default(),
            connect_info,
        )
    }

    fn with_parts(
        binding: ResourceBinding,
        state_machine: InvocationStateMachine,
        error_action_preference: ErrorAction,
        connect_info: Option<RemoteConnectInfo>,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(instance = %id, "created PowerShell instance");
        Self {
            inner: Arc::new(PsInstance {
                id,
                state_machine,
                core: Mutex::new(InstanceCore {
                    commands: Vec::new(),
                    binding,
                    io: PipelineIo::new(),
                    output_owned: true,
                    worker: None,
                    invoke_result: None,
                    stop_result: None,
                    batch: None,
                    settings: InvocationSettings::default(),
                    sync_invoke: false,
                    error_action_preference,
                    remote_channel: None,
                    connect_info,
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> PsInvocationStateInfo {
        self.inner.state_machine.current()
    }

    pub fn on_state_changed(&self, handler: StateChangedHandler) {
        self.inner.state_machine.subscribe(handler);
    }

    /// Informational streams of this instance; handles stay valid across
    /// invocations.
    pub fn streams(&self) -> PsDataStreams {
        self.inner.core_lock().io.data.clone()
    }

    /// The instance's visible command list.
    pub fn commands(&self) -> Vec<PipelineCommand> {
        self.inner.core_lock().commands.clone()
    }

    pub fn add_command(&self, command: PipelineCommand) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        self.inner.core_lock().commands.push(command);
        Ok(())
    }

    pub fn add_script(&self, script: impl Into<String>) -> Result<(), PwshInvokeError> {
        self.add_command(PipelineCommand::new_script(script.into()))
    }

    /// Add a parameter to the last command.
    pub fn add_parameter(
        &self,
        name: impl Into<String>,
        value: PsValue,
    ) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        let mut core = self.inner.core_lock();
        let Some(last) = core.commands.last_mut() else {
            return Err(PwshInvokeError::InvalidState(
                "cannot add a parameter with no prior command",
            ));
        };
        last.add_parameter(name.into(), value);
        Ok(())
    }

    pub fn add_switch_parameter(&self, name: impl Into<String>) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        let mut core = self.inner.core_lock();
        let Some(last) = core.commands.last_mut() else {
            return Err(PwshInvokeError::InvalidState(
                "cannot add a parameter with no prior command",
            ));
        };
        last.add_switch_parameter(name.into());
        Ok(())
    }

    /// End the current statement; the next command added starts a new one
    /// and the invocation becomes a batch.
    pub fn add_statement(&self) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        let mut core = self.inner.core_lock();
        let Some(last) = core.commands.last_mut() else {
            return Err(PwshInvokeError::InvalidState(
                "cannot end a statement with no prior command",
            ));
        };
        last.mark_end_of_statement();
        Ok(())
    }

    pub fn set_runspace(&self, runspace: Arc<dyn Runspace>) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        self.inner.core_lock().binding = ResourceBinding::Runspace(runspace);
        Ok(())
    }

    pub fn set_runspace_pool(&self, pool: Arc<dyn RunspacePool>) -> Result<(), PwshInvokeError> {
        self.inner.assert_can_mutate()?;
        self.inner.core_lock().binding = ResourceBinding::Pool(pool);
        Ok(())
    }

    /// Invoke synchronously; blocks until the command (or batch) finishes
    /// and returns the output buffer.
    pub fn invoke(&self) -> Result<DataStream<PsValue>, PwshInvokeError> {
        self.invoke_with(Vec::new(), InvocationSettings::default())
    }

    #[instrument(skip_all, fields(instance = %self.inner.id))]
    pub fn invoke_with(
        &self,
        input: Vec<PsValue>,
        settings: InvocationSettings,
    ) -> Result<DataStream<PsValue>, PwshInvokeError> {
        let input_stream = DataStream::new();
        for item in input {
            input_stream.write(item)?;
        }
        input_stream.close();

        let result = self
            .inner
            .core_invoke(input_stream, None, settings, None, true)?;
        result.wait()?;
        self.inner.disown_output();
        Ok(result.output().unwrap_or_default())
    }

    /// Start an asynchronous invocation; redeem the handle with
    /// [`Self::end_invoke`].
    pub fn begin_invoke(&self) -> Result<AsyncResult, PwshInvokeError> {
        self.begin_invoke_with(Vec::new(), None, InvocationSettings::default(), None)
    }

    #[instrument(skip_all, fields(instance = %self.inner.id))]
    pub fn begin_invoke_with(
        &self,
        input: Vec<PsValue>,
        output: Option<DataStream<PsValue>>,
        settings: InvocationSettings,
        callback: Option<AsyncResultCallback>,
    ) -> Result<AsyncResult, PwshInvokeError> {
        let input_stream = DataStream::new();
        for item in input {
            input_stream.write(item)?;
        }
        input_stream.close();

        self.inner
            .core_invoke(input_stream, output, settings, callback, false)
    }

    /// Asynchronous invocation fed by a caller-controlled input stream; the
    /// pipeline observes end-of-input when the stream is closed.
    pub fn begin_invoke_streaming(
        &self,
        input: DataStream<PsValue>,
        output: Option<DataStream<PsValue>>,
        settings: InvocationSettings,
        callback: Option<AsyncResultCallback>,
    ) -> Result<AsyncResult, PwshInvokeError> {
        self.inner
            .core_invoke(input, output, settings, callback, false)
    }

    /// Wait for an asynchronous invocation and hand its output buffer back.
    /// The buffer's ownership crosses to the caller.
    pub fn end_invoke(
        &self,
        result: &AsyncResult,
    ) -> Result<DataStream<PsValue>, PwshInvokeError> {
        if result.owner() != self.inner.id {
            return Err(PwshInvokeError::InvalidArgument(
                "async result does not belong to this instance",
            ));
        }
        if result.kind() != AsyncResultKind::Invoke {
            return Err(PwshInvokeError::InvalidArgument(
                "async result is not an invocation handle",
            ));
        }
        result.wait()?;
        self.inner.disown_output();
        Ok(result.output().unwrap_or_default())
    }

    /// Cooperatively stop the running command and block until the stop is
    /// acknowledged. Safe to call from any thread, any number of times.
    #[instrument(skip_all, fields(instance = %self.inner.id))]
    pub fn stop(&self) -> Result<(), PwshInvokeError> {
        let result = self.inner.core_stop(true, None)?;
        result.wait()?;
        self.inner.disown_output();
        Ok(())
    }

    pub fn begin_stop(
        &self,
        callback: Option<AsyncResultCallback>,
    ) -> Result<AsyncResult, PwshInvokeError> {
        self.inner.core_stop(false, callback)
    }

    pub fn end_stop(&self, result: &AsyncResult) -> Result<(), PwshInvokeError> {
        if result.owner() != self.inner.id {
            return Err(PwshInvokeError::InvalidArgument(
                "async result does not belong to this instance",
            ));
        }
        if result.kind() != AsyncResultKind::Stop {
            return Err(PwshInvokeError::InvalidArgument(
                "async result is not a stop handle",
            ));
        }
        result.wait()?;
        self.inner.disown_output();
        Ok(())
    }

    /// Reconnect a `Disconnected` command and block until it finishes,
    /// returning the output buffer.
    pub fn connect(&self) -> Result<DataStream<PsValue>, PwshInvokeError> {
        let result = self.inner.core_connect(None, None, true)?;
        result.wait()?;
        self.inner.disown_output();
        Ok(result.output().unwrap_or_default())
    }

    /// Reconnect a `Disconnected` command asynchronously.
    pub fn connect_async(
        &self,
        output: Option<DataStream<PsValue>>,
        callback: Option<AsyncResultCallback>,
    ) -> Result<AsyncResult, PwshInvokeError> {
        self.inner.core_connect(output, callback, false)
    }

    #[cfg(test)]
    pub(crate) fn output_owned(&self) -> bool {
        self.inner.core_lock().output_owned
    }
}

impl PsInstance {
    pub(crate) fn core_lock(&self) -> MutexGuard<'_, InstanceCore> {
        self.core.lock().unwrap()
    }

    pub(crate) fn stop_pending(&self) -> bool {
        self.core_lock().stop_result.is_some()
    }

    pub(crate) fn remote_channel(&self) -> Option<Arc<dyn RemoteChannel>> {
        self.core_lock().remote_channel.clone()
    }

    pub(crate) fn install_worker(&self, worker: &Arc<ExecutionWorker>) {
        self.core_lock().worker = Some(Arc::clone(worker));
    }

    pub(crate) fn uninstall_worker(&self, worker: &Arc<ExecutionWorker>) {
        let mut core = self.core_lock();
        if core
            .worker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, worker))
        {
            core.worker = None;
        }
    }

    /// Binding, streams and settings for a worker of the current invocation.
    pub(crate) fn worker_inputs(
        &self,
    ) -> Result<(WorkerBinding, PipelineIo, InvocationSettings), PwshInvokeError> {
        let core = self.core_lock();
        let binding = Self::resolve_worker_binding(&core)?;
        Ok((binding, core.io.clone(), core.settings.clone()))
    }

    fn resolve_worker_binding(core: &InstanceCore) -> Result<WorkerBinding, PwshInvokeError> {
        match &core.binding {
            ResourceBinding::Runspace(runspace) => {
                Ok(WorkerBinding::Assigned(Arc::clone(runspace)))
            }
            ResourceBinding::Pool(pool) => Ok(WorkerBinding::Pool(Arc::clone(pool))),
            ResourceBinding::Unbound {
                factory: Some(factory),
            } => Ok(WorkerBinding::Factory(Arc::clone(factory))),
            ResourceBinding::Unbound { factory: None } => Err(PwshInvokeError::InvalidState(
                "no runspace, pool or factory is bound to this instance",
            )),
        }
    }

    fn assert_can_mutate(&self) -> Result<(), PwshInvokeError> {
        let state = self.state_machine.current().state;
        if state == PsInvocationState::NotStarted || state.is_terminal() {
            Ok(())
        } else {
            Err(PwshInvokeError::InvalidState(
                "commands cannot be changed while the instance is running, stopping or disconnected",
            ))
        }
    }

    pub(crate) fn disown_output(&self) {
        self.core_lock().output_owned = false;
    }

    /// Handler wired into pipelines and remote channels: forwards their
    /// state into this instance, subject to batch interception.
    fn pipeline_events(self: &Arc<Self>) -> PipelineStateHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |info: PsInvocationStateInfo| {
            if let Some(instance) = weak.upgrade() {
                instance.on_pipeline_state_changed(info);
            }
        })
    }

    /// A sub-pipeline state change arrives here. Terminal states of an
    /// intermediate batch statement are consumed by the batch engine; all
    /// other notifications flow into the instance state machine.
    pub(crate) fn on_pipeline_state_changed(self: &Arc<Self>, info: PsInvocationStateInfo) {
        enum Action {
            Forward(PsInvocationStateInfo),
            ContinueBatch(Option<crate::streams::ErrorRecord>),
            Abort(PsInvocationStateInfo),
        }

        let action = {
            let core = self.core_lock();
            match &core.batch {
                Some(batch) if batch.has_remaining() && info.state.is_terminal() => {
                    match crate::batch::statement_policy(batch.error_action, &info) {
                        crate::batch::PolicyDecision::Continue { record } => {
                            Action::ContinueBatch(record)
                        }
                        crate::batch::PolicyDecision::Abort(final_info) => {
                            Action::Abort(final_info)
                        }
                    }
                }
                _ => Action::Forward(info),
            }
        };

        match action {
            Action::Forward(info) | Action::Abort(info) => self.set_state_changed(info),
            Action::ContinueBatch(record) => {
                if let Some(record) = record {
                    let error_stream = self.core_lock().io.data.error.clone();
                    if let Err(error) = error_stream.write(record) {
                        warn!(%error, "could not surface batch statement error");
                    }
                }
                // recycle the finished statement's worker before moving on
                let worker = self.core_lock().worker.take();
                if let Some(worker) = worker {
                    worker.release(false);
                }
                let instance = Arc::clone(self);
                std::thread::spawn(move || instance.drive_remaining_statements());
            }
        }
    }

    /// Apply a state transition and its side effects. This is the only path
    /// through which the instance's observable state changes.
    pub(crate) fn set_state_changed(self: &Arc<Self>, incoming: PsInvocationStateInfo) {
        let Some((previous, applied)) = self.state_machine.request_transition(incoming) else {
            return;
        };

        match applied.state {
            PsInvocationState::Running => {
                if previous == PsInvocationState::Disconnected {
                    // a reconnected synchronous command must observe
                    // end-of-input to be able to finish
                    let input = {
                        let core = self.core_lock();
                        core.sync_invoke.then(|| core.io.input.clone())
                    };
                    if let Some(input) = input {
                        if input.is_open() {
                            input.close();
                        }
                    }
                }
                self.state_machine.dispatch(&applied);
            }
            PsInvocationState::Disconnected => {
                let channel = {
                    let mut core = self.core_lock();
                    // a later reconnect without this info is a resume, not a
                    // reconstruct
                    core.connect_info = None;
                    core.remote_channel.clone()
                };
                if let Some(channel) = channel {
                    channel.suspend_receive();
                }
                self.state_machine.dispatch(&applied);
            }
            PsInvocationState::NotStarted | PsInvocationState::Stopping => {
                self.state_machine.dispatch(&applied);
            }
            PsInvocationState::Stopped
            | PsInvocationState::Completed
            | PsInvocationState::Failed => self.finish_terminal(&applied),
        }
    }

    /// Terminal-state side effects, in a deliberate order: release held
    /// resources, resume a suspended remote receive queue, then signal the
    /// invoke result and fire the event. The invoke result is signaled after
    /// the event while batch statements are still pending, before it
    /// otherwise, and the stop result always completes last.
    fn finish_terminal(self: &Arc<Self>, applied: &PsInvocationStateInfo) {
        let (worker, invoke_result, stop_result, extra_pending, channel, io, close_output) = {
            let mut core = self.core_lock();
            let extra_pending = core.batch.as_ref().is_some_and(BatchState::has_remaining);
            if let Some(batch) = core.batch.take() {
                // the visible command list is unaffected by batch bookkeeping
                core.commands = batch.original_commands;
            }
            (
                core.worker.take(),
                core.invoke_result.take(),
                core.stop_result.take(),
                extra_pending,
                core.remote_channel.take(),
                core.io.clone(),
                core.output_owned,
            )
        };

        if let Some(worker) = worker {
            worker.release(true);
        } else {
            io.close_internal();
        }
        if close_output {
            io.output.close();
        }
        if let Some(channel) = channel {
            channel.set_state_changed(None);
            channel.resume_receive();
        }

        let invoke_reason = match applied.state {
            PsInvocationState::Failed => applied.reason.clone().or(Some(
                PwshInvokeError::UnlikelyToHappen("invocation failed with no recorded reason"),
            )),
            _ => None,
        };

        if extra_pending {
            self.state_machine.dispatch(applied);
            if let Some(result) = invoke_result {
                result.set_completed(invoke_reason);
            }
        } else {
            if let Some(result) = invoke_result {
                result.set_completed(invoke_reason);
            }
            self.state_machine.dispatch(applied);
        }

        if let Some(result) = stop_result {
            result.set_completed(None);
        }
    }

    /// The one core invoke routine every public invoke surface funnels
    /// through.
    fn core_invoke(
        self: &Arc<Self>,
        input: DataStream<PsValue>,
        output: Option<DataStream<PsValue>>,
        settings: InvocationSettings,
        callback: Option<AsyncResultCallback>,
        sync: bool,
    ) -> Result<AsyncResult, PwshInvokeError> {
        let (result, route) = {
            let mut core = self.core_lock();

            match self.state_machine.current().state {
                PsInvocationState::Running | PsInvocationState::Stopping => {
                    return Err(PwshInvokeError::InvalidState(
                        "cannot invoke while the command is running or stopping",
                    ));
                }
                PsInvocationState::Disconnected => {
                    return Err(PwshInvokeError::InvalidState(
                        "cannot invoke a disconnected command; connect it first",
                    ));
                }
                _ => {}
            }
            if core.commands.is_empty() {
                return Err(PwshInvokeError::InvalidArgument("no command to invoke"));
            }
            if core.worker.is_some() {
                return Err(PwshInvokeError::InvalidState(
                    "another invocation is still holding this instance",
                ));
            }

            let remote = match &core.binding {
                ResourceBinding::Pool(pool) => pool.remote_channel(),
                _ => None,
            };
            if remote.is_none() {
                // fail fast before any state becomes observable
                Self::resolve_worker_binding(&core)?;
            }

            self.state_machine.reset_for_restart();

            let (output_stream, output_owned) = match output {
                Some(stream) => (stream, false),
                None => (DataStream::new(), true),
            };
            core.io.input = input;
            core.io.output = output_stream.clone();
            core.io.data.reopen_all();
            core.output_owned = output_owned;
            core.sync_invoke = sync;
            core.settings = settings.clone();
            core.stop_result = None;

            let spec = PipelineSpec {
                commands: core.commands.clone(),
                is_nested: false,
                add_to_history: settings.add_to_history,
            };
            let statements = spec.split_statements();
            debug!(statements = statements.len(), sync, "prepared invocation");

            let route = if statements.len() > 1 {
                let error_action = settings
                    .error_action
                    .unwrap_or(core.error_action_preference);
                let single_shot = remote.as_ref().is_some_and(|channel| {
                    channel.protocol_version().supports_batch_invocation()
                });
                let (mode, next_index) = if single_shot {
                    (BatchMode::RemoteSingleShot, statements.len())
                } else if sync && remote.is_none() {
                    // every statement is driven inline on the calling thread
                    (BatchMode::Local, 0)
                } else {
                    // statement 1 goes through the normal invoke path
                    (BatchMode::Local, 1)
                };
                core.batch = Some(BatchState {
                    statements: statements.clone(),
                    next_index,
                    error_action,
                    original_commands: std::mem::replace(
                        &mut core.commands,
                        statements[0].commands.clone(),
                    ),
                    mode,
                });
                match (remote, mode, sync) {
                    (Some(channel), BatchMode::RemoteSingleShot, _) => {
                        core.remote_channel = Some(Arc::clone(&channel));
                        InvokeRoute::Remote {
                            channel,
                            statements,
                        }
                    }
                    (Some(channel), BatchMode::Local, _) => {
                        core.remote_channel = Some(Arc::clone(&channel));
                        InvokeRoute::Remote {
                            channel,
                            statements: vec![statements[0].clone()],
                        }
                    }
                    (None, _, true) => InvokeRoute::LocalBatchInline,
                    (None, _, false) => {
                        let worker = ExecutionWorker::new(
                            sync,
                            statements[0].clone(),
                            core.io.clone(),
                            settings.clone(),
                            Self::resolve_worker_binding(&core)?,
                            self.pipeline_events(),
                        );
                        core.worker = Some(Arc::clone(&worker));
                        InvokeRoute::LocalWorker { worker }
                    }
                }
            } else {
                core.batch = None;
                match remote {
                    Some(channel) => {
                        core.remote_channel = Some(Arc::clone(&channel));
                        InvokeRoute::Remote {
                            channel,
                            statements: vec![spec],
                        }
                    }
                    None => {
                        let worker = ExecutionWorker::new(
                            sync,
                            spec,
                            core.io.clone(),
                            settings.clone(),
                            Self::resolve_worker_binding(&core)?,
                            self.pipeline_events(),
                        );
                        core.worker = Some(Arc::clone(&worker));
                        InvokeRoute::LocalWorker { worker }
                    }
                }
            };

            let result = AsyncResult::new(
                self.id,
                AsyncResultKind::Invoke,
                callback,
                Some(output_stream),
            );
            core.invoke_result = Some(result.clone());
            (result, route)
        };

        // the Running transition is observable before any pipeline exists,
        // and the worker (or channel) is already installed so a concurrent
        // stop routes to it instead of synthesizing its own terminal
        self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Running));

        // a subscriber may have stopped the instance from inside the Running
        // dispatch; a terminal state here means finish_terminal already tore
        // the invocation down and launching anything would resurrect it
        if self.state_machine.current().state.is_terminal() {
            return Ok(result);
        }

        match route {
            InvokeRoute::LocalWorker { worker } => {
                if sync {
                    if let Err(error) = worker.run() {
                        self.fail_before_completion(&error);
                        return Err(error);
                    }
                } else {
                    worker.run_async_detached();
                }
            }
            InvokeRoute::LocalBatchInline => {
                self.drive_remaining_statements();
            }
            InvokeRoute::Remote {
                channel,
                statements,
            } => {
                let io = self.core_lock().io.clone();
                if let Err(error) = channel.initialize(&io, &settings) {
                    self.fail_before_completion(&error);
                    return Err(error);
                }
                channel.set_state_changed(Some(self.pipeline_events()));
                if let Err(error) = channel.invoke_async(&statements) {
                    self.fail_before_completion(&error);
                    return Err(error);
                }
            }
        }

        Ok(result)
    }

    /// A setup failure is reported synchronously to the caller, so the
    /// pending invoke handle is released without running its callback
    /// before the `Failed` transition takes the instance down.
    fn fail_before_completion(self: &Arc<Self>, error: &PwshInvokeError) {
        let orphan = self.core_lock().invoke_result.take();
        if let Some(orphan) = orphan {
            orphan.release();
        }
        self.set_state_changed(PsInvocationStateInfo::with_reason(
            PsInvocationState::Failed,
            error.clone(),
        ));
    }

    /// The one core stop routine. Concurrent stops share the pending stop
    /// result; stop on a finished instance is a completed no-op.
    fn core_stop(
        self: &Arc<Self>,
        sync: bool,
        callback: Option<AsyncResultCallback>,
    ) -> Result<AsyncResult, PwshInvokeError> {
        enum StopRoute {
            AlreadyPending,
            Synthesize,
            DisconnectedFail,
            Worker(Arc<ExecutionWorker>),
            Channel(Arc<dyn RemoteChannel>),
            BatchGap,
        }

        let current = self.state_machine.current().state;
        if current.is_terminal() {
            let result = AsyncResult::new(self.id, AsyncResultKind::Stop, callback, None);
            result.set_completed(None);
            return Ok(result);
        }

        let (result, route) = {
            let mut core = self.core_lock();
            if let Some(existing) = &core.stop_result {
                (existing.clone(), StopRoute::AlreadyPending)
            } else {
                let result = AsyncResult::new(self.id, AsyncResultKind::Stop, callback, None);
                core.stop_result = Some(result.clone());
                let route = match current {
                    PsInvocationState::NotStarted => StopRoute::Synthesize,
                    PsInvocationState::Disconnected => StopRoute::DisconnectedFail,
                    _ => {
                        if let Some(worker) = &core.worker {
                            StopRoute::Worker(Arc::clone(worker))
                        } else if let Some(channel) = &core.remote_channel {
                            StopRoute::Channel(Arc::clone(channel))
                        } else if core.batch.is_some() {
                            StopRoute::BatchGap
                        } else {
                            StopRoute::Synthesize
                        }
                    }
                };
                (result, route)
            }
        };

        // the invocation may have finished between the state read and the
        // bookkeeping above; its cleanup can no longer see our stop result
        if self.state_machine.current().state.is_terminal() {
            if let Some(orphan) = self.core_lock().stop_result.take() {
                orphan.set_completed(None);
            }
            result.set_completed(None);
            return Ok(result);
        }

        match route {
            StopRoute::AlreadyPending => {
                debug!("stop already pending; reusing its result");
            }
            StopRoute::Synthesize => {
                // nothing ever ran: Stopping then Stopped, never Running
                self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Stopping));
                let instance = Arc::clone(self);
                let synthesize = move || {
                    instance
                        .set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Stopped));
                };
                if sync {
                    synthesize();
                } else {
                    std::thread::spawn(synthesize);
                }
            }
            StopRoute::DisconnectedFail => {
                self.set_state_changed(PsInvocationStateInfo::with_reason(
                    PsInvocationState::Failed,
                    PwshInvokeError::InvalidState("the command was stopped while disconnected"),
                ));
            }
            StopRoute::Worker(worker) => {
                self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Stopping));
                worker.stop(sync);
            }
            StopRoute::Channel(channel) => {
                self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Stopping));
                if let Err(error) = channel.stop_async() {
                    warn!(%error, "remote stop request failed");
                    self.set_state_changed(PsInvocationStateInfo::with_reason(
                        PsInvocationState::Failed,
                        error,
                    ));
                }
            }
            StopRoute::BatchGap => {
                // between statements; the driving loop observes the pending
                // stop before starting the next one
                self.set_state_changed(PsInvocationStateInfo::new(PsInvocationState::Stopping));
            }
        }

        Ok(result)
    }

    /// The one core connect routine for a `Disconnected` command.
    fn core_connect(
        self: &Arc<Self>,
        output: Option<DataStream<PsValue>>,
        callback: Option<AsyncResultCallback>,
        sync: bool,
    ) -> Result<AsyncResult, PwshInvokeError> {
        if self.state_machine.current().state != PsInvocationState::Disconnected {
            return Err(PwshInvokeError::InvalidState(
                "connect is only valid on a disconnected command",
            ));
        }

        let (pool, cached_channel, connect_info) = {
            let core = self.core_lock();
            let ResourceBinding::Pool(pool) = &core.binding else {
                return Err(PwshInvokeError::InvalidState(
                    "a disconnected command must be bound to a runspace pool",
                ));
            };
            (
                Arc::clone(pool),
                core.remote_channel.clone(),
                core.connect_info.clone(),
            )
        };

        // the bound resource must itself be connected before the command can
        if pool.state() == RunspacePoolState::Disconnected {
            pool.connect()?;
        }
        if pool.state() != RunspacePoolState::Opened {
            return Err(PwshInvokeError::InvalidState(
                "the runspace pool must be opened before connecting a command",
            ));
        }

        let channel = cached_channel
            .or_else(|| pool.remote_channel())
            .ok_or(PwshInvokeError::InvalidState(
                "the runspace pool has no remote channel",
            ))?;

        let reconstruct = connect_info.is_some();
        // a caller-supplied output buffer changes the channel's stream
        // binding and forces a re-initialize even on a resume
        let rebind = reconstruct || output.is_some();
        let (result, io, settings) = {
            let mut core = self.core_lock();
            core.remote_channel = Some(Arc::clone(&channel));
            core.sync_invoke = sync;

            let result = if reconstruct {
                // fresh local state and streams for an existing remote command
                let (output_stream, output_owned) = match output {
                    Some(stream) => (stream, false),
                    None => (DataStream::new(), true),
                };
                core.io.input = DataStream::new();
                core.io.output = output_stream.clone();
                core.output_owned = output_owned;
                let result = AsyncResult::new(
                    self.id,
                    AsyncResultKind::Invoke,
                    callback,
                    Some(output_stream),
                );
                core.invoke_result = Some(result.clone());
                result
            } else {
                // resume: the existing result and channel are assumed valid
                // unless the caller replaces them or the result already fired
                let reusable = output.is_none()
                    && callback.is_none()
                    && core
                        .invoke_result
                        .as_ref()
                        .is_some_and(|existing| !existing.is_completed());
                if reusable {
                    core.invoke_result.clone().ok_or(
                        PwshInvokeError::UnlikelyToHappen("reusable invoke result vanished"),
                    )?
                } else {
                    let (output_stream, output_owned) = match output {
                        Some(stream) => (stream, false),
                        None => (core.io.output.clone(), core.output_owned),
                    };
                    core.io.output = output_stream.clone();
                    core.output_owned = output_owned;
                    let result = AsyncResult::new(
                        self.id,
                        AsyncResultKind::Invoke,
                        callback,
                        Some(output_stream),
                    );
                    core.invoke_result = Some(result.clone());
                    result
                }
            };
            (result, core.io.clone(), core.settings.clone())
        };

        if rebind {
            channel.initialize(&io, &settings)?;
        }
        channel.set_state_changed(Some(self.pipeline_events()));
        channel.connect_async(connect_info.as_ref())?;

        Ok(result)
    }
}
