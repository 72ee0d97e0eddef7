//! Scriptable doubles for the consumed contracts. A fake pipeline's behavior
//! is the text of the statement's first command: `emit:a,b` writes values,
//! `fail:msg` terminates in `Failed`, `block` runs until stopped, `sleep:N`
//! completes after N milliseconds, `echo` copies input to output, `manual`
//! ignores stop and finishes only through [`FakePipeline::force_finish`],
//! and on the remote channel `hold` stays running while `disconnect` drops
//! into `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::pipeline::{Pipeline, PipelineCommand, PipelineSpec, PipelineStateHandler, PsValue};
use crate::powershell::{InvocationSettings, PowerShell, PowerShellConfig};
use crate::remote::{ProtocolVersion, RemoteChannel, RemoteConnectInfo};
use crate::runspace::{
    ApartmentState, PipelineIo, Runspace, RunspacePool, RunspacePoolState, RunspaceReadyHandler,
    RunspaceState, RunspaceTicket,
};
use crate::state::{PsInvocationState, PsInvocationStateInfo};
use crate::PwshInvokeError;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `ready` holds, failing the test after a generous timeout.
pub fn wait_until(what: &str, ready: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn script(text: &str) -> PipelineCommand {
    PipelineCommand::new_script(text.to_string())
}

pub fn statement(text: &str) -> PipelineCommand {
    let mut command = script(text);
    command.mark_end_of_statement();
    command
}

pub fn shell_on(runspace: Arc<FakeRunspace>) -> PowerShell {
    init_tracing();
    PowerShell::new(PowerShellConfig::builder().runspace(runspace).build())
}

pub fn shell_on_pool(pool: Arc<FakePool>) -> PowerShell {
    init_tracing();
    PowerShell::new(PowerShellConfig::builder().runspace_pool(pool).build())
}

pub fn strings(values: &[PsValue]) -> Vec<String> {
    values
        .iter()
        .map(|value| match value {
            PsValue::String(text) => text.clone(),
            other => panic!("expected a string output, got {other:?}"),
        })
        .collect()
}

pub struct FakePipeline {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    behavior: String,
    io: PipelineIo,
    handler: Mutex<Option<PipelineStateHandler>>,
    state: Mutex<PsInvocationStateInfo>,
    started: AtomicBool,
    terminal_sent: AtomicBool,
    stop: Mutex<bool>,
    stop_cond: Condvar,
    done: Mutex<bool>,
    done_cond: Condvar,
}

impl Clone for FakePipeline {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl FakePipeline {
    fn new(behavior: String, io: PipelineIo) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                behavior,
                io,
                handler: Mutex::new(None),
                state: Mutex::new(PsInvocationStateInfo::new(PsInvocationState::NotStarted)),
                started: AtomicBool::new(false),
                terminal_sent: AtomicBool::new(false),
                stop: Mutex::new(false),
                stop_cond: Condvar::new(),
                done: Mutex::new(false),
                done_cond: Condvar::new(),
            }),
        }
    }

    fn finish(&self, info: PsInvocationStateInfo) {
        *self.inner.state.lock().unwrap() = info.clone();
        if !self.inner.terminal_sent.swap(true, Ordering::SeqCst) {
            let handler = self.inner.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(info);
            }
        }
        *self.inner.done.lock().unwrap() = true;
        self.inner.done_cond.notify_all();
    }

    fn run(&self) -> Result<(), PwshInvokeError> {
        self.inner.started.store(true, Ordering::SeqCst);
        let behavior = self.inner.behavior.clone();

        if let Some(items) = behavior.strip_prefix("emit:") {
            for item in items.split(',').filter(|item| !item.is_empty()) {
                self.inner
                    .io
                    .output
                    .write(PsValue::String(item.to_string()))?;
            }
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Completed));
            Ok(())
        } else if let Some(message) = behavior.strip_prefix("fail:") {
            let error = PwshInvokeError::PipelineError(message.to_string());
            self.finish(PsInvocationStateInfo::with_reason(
                PsInvocationState::Failed,
                error.clone(),
            ));
            Err(error)
        } else if behavior == "block" {
            let mut stopped = self.inner.stop.lock().unwrap();
            while !*stopped {
                stopped = self.inner.stop_cond.wait(stopped).unwrap();
            }
            drop(stopped);
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Stopped));
            Ok(())
        } else if let Some(millis) = behavior.strip_prefix("sleep:") {
            std::thread::sleep(Duration::from_millis(millis.parse().unwrap_or(10)));
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Completed));
            Ok(())
        } else if behavior == "echo" {
            for item in self.inner.io.input.drain() {
                self.inner.io.output.write(item)?;
            }
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Completed));
            Ok(())
        } else if behavior == "manual" {
            let mut done = self.inner.done.lock().unwrap();
            while !*done {
                done = self.inner.done_cond.wait(done).unwrap();
            }
            Ok(())
        } else {
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Completed));
            Ok(())
        }
    }

    /// Drive a `manual` pipeline to its end from the test body.
    pub fn force_finish(&self, info: PsInvocationStateInfo) {
        self.finish(info);
    }

    fn request_stop(&self, wait: bool) {
        if self.inner.behavior == "manual" {
            return;
        }
        *self.inner.stop.lock().unwrap() = true;
        self.inner.stop_cond.notify_all();

        if !self.inner.started.load(Ordering::SeqCst) {
            self.finish(PsInvocationStateInfo::new(PsInvocationState::Stopped));
            return;
        }
        if wait {
            let mut done = self.inner.done.lock().unwrap();
            while !*done {
                done = self.inner.done_cond.wait(done).unwrap();
            }
        }
    }
}

impl Pipeline for FakePipeline {
    fn invoke(&self) -> Result<(), PwshInvokeError> {
        self.run()
    }

    fn invoke_async(&self) -> Result<(), PwshInvokeError> {
        let pipeline = self.clone();
        std::thread::spawn(move || {
            let _ = pipeline.run();
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), PwshInvokeError> {
        self.request_stop(true);
        Ok(())
    }

    fn stop_async(&self) -> Result<(), PwshInvokeError> {
        self.request_stop(false);
        Ok(())
    }

    fn set_state_changed(&self, handler: Option<PipelineStateHandler>) {
        *self.inner.handler.lock().unwrap() = handler;
    }

    fn state(&self) -> PsInvocationStateInfo {
        self.inner.state.lock().unwrap().clone()
    }
}

pub struct FakeRunspace {
    id: Uuid,
    state: Mutex<RunspaceState>,
    apartment: ApartmentState,
    pipelines: Mutex<Vec<FakePipeline>>,
}

impl FakeRunspace {
    pub fn opened() -> Arc<Self> {
        Self::with_state(RunspaceState::Opened, ApartmentState::Unknown)
    }

    pub fn before_open() -> Arc<Self> {
        Self::with_state(RunspaceState::BeforeOpen, ApartmentState::Unknown)
    }

    pub fn with_apartment(apartment: ApartmentState) -> Arc<Self> {
        Self::with_state(RunspaceState::Opened, apartment)
    }

    fn with_state(state: RunspaceState, apartment: ApartmentState) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: Mutex::new(state),
            apartment,
            pipelines: Mutex::new(Vec::new()),
        })
    }

    pub fn pipelines(&self) -> Vec<FakePipeline> {
        self.pipelines.lock().unwrap().clone()
    }

    pub fn current_state(&self) -> RunspaceState {
        *self.state.lock().unwrap()
    }
}

impl Runspace for FakeRunspace {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> RunspaceState {
        *self.state.lock().unwrap()
    }

    fn open(&self) -> Result<(), PwshInvokeError> {
        *self.state.lock().unwrap() = RunspaceState::Opened;
        Ok(())
    }

    fn close(&self) -> Result<(), PwshInvokeError> {
        *self.state.lock().unwrap() = RunspaceState::Closed;
        Ok(())
    }

    fn apartment_state(&self) -> ApartmentState {
        self.apartment
    }

    fn create_pipeline(
        &self,
        spec: &PipelineSpec,
        io: &PipelineIo,
    ) -> Result<Arc<dyn Pipeline>, PwshInvokeError> {
        let behavior = spec
            .commands
            .first()
            .map(|command| command.command_text.clone())
            .unwrap_or_default();
        let pipeline = FakePipeline::new(behavior, io.clone());
        self.pipelines.lock().unwrap().push(pipeline.clone());
        Ok(Arc::new(pipeline))
    }
}

enum TicketSlot {
    Pending,
    Ready,
    Cancelled,
}

pub struct FakePool {
    state: Mutex<RunspacePoolState>,
    fulfill_immediately: bool,
    tickets: Mutex<HashMap<Uuid, TicketSlot>>,
    tickets_cond: Condvar,
    runspace: Arc<FakeRunspace>,
    released: AtomicUsize,
    cancelled: AtomicUsize,
    connects: AtomicUsize,
    channel: Option<Arc<FakeRemoteChannel>>,
}

impl FakePool {
    pub fn immediate(runspace: Arc<FakeRunspace>) -> Arc<Self> {
        Self::build(RunspacePoolState::Opened, true, runspace, None)
    }

    /// Acquisitions stay pending until cancelled; for stop-races-acquisition
    /// scenarios.
    pub fn manual(runspace: Arc<FakeRunspace>) -> Arc<Self> {
        Self::build(RunspacePoolState::Opened, false, runspace, None)
    }

    pub fn remote(channel: Arc<FakeRemoteChannel>) -> Arc<Self> {
        Self::build(
            RunspacePoolState::Opened,
            true,
            FakeRunspace::opened(),
            Some(channel),
        )
    }

    pub fn disconnected_remote(channel: Arc<FakeRemoteChannel>) -> Arc<Self> {
        Self::build(
            RunspacePoolState::Disconnected,
            true,
            FakeRunspace::opened(),
            Some(channel),
        )
    }

    fn build(
        state: RunspacePoolState,
        fulfill_immediately: bool,
        runspace: Arc<FakeRunspace>,
        channel: Option<Arc<FakeRemoteChannel>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            fulfill_immediately,
            tickets: Mutex::new(HashMap::new()),
            tickets_cond: Condvar::new(),
            runspace,
            released: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            channel,
        })
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl RunspacePool for FakePool {
    fn state(&self) -> RunspacePoolState {
        *self.state.lock().unwrap()
    }

    fn connect(&self) -> Result<(), PwshInvokeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = RunspacePoolState::Opened;
        Ok(())
    }

    fn begin_get_runspace(
        &self,
        on_ready: RunspaceReadyHandler,
    ) -> Result<RunspaceTicket, PwshInvokeError> {
        let ticket = RunspaceTicket::new(Uuid::new_v4());
        let slot = if self.fulfill_immediately {
            TicketSlot::Ready
        } else {
            TicketSlot::Pending
        };
        self.tickets.lock().unwrap().insert(ticket.id(), slot);
        self.tickets_cond.notify_all();

        if self.fulfill_immediately {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                on_ready(ticket);
            });
        }
        Ok(ticket)
    }

    fn end_get_runspace(
        &self,
        ticket: RunspaceTicket,
    ) -> Result<Arc<dyn Runspace>, PwshInvokeError> {
        let mut tickets = self.tickets.lock().unwrap();
        loop {
            match tickets.get(&ticket.id()) {
                Some(TicketSlot::Ready) => {
                    tickets.remove(&ticket.id());
                    return Ok(Arc::clone(&self.runspace) as Arc<dyn Runspace>);
                }
                Some(TicketSlot::Cancelled) | None => {
                    tickets.remove(&ticket.id());
                    return Err(PwshInvokeError::StopRequested);
                }
                Some(TicketSlot::Pending) => {
                    tickets = self.tickets_cond.wait(tickets).unwrap();
                }
            }
        }
    }

    fn cancel_get_runspace(&self, ticket: RunspaceTicket) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.tickets
            .lock()
            .unwrap()
            .insert(ticket.id(), TicketSlot::Cancelled);
        self.tickets_cond.notify_all();
    }

    fn release_runspace(&self, _runspace: Arc<dyn Runspace>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn remote_channel(&self) -> Option<Arc<dyn RemoteChannel>> {
        self.channel
            .clone()
            .map(|channel| channel as Arc<dyn RemoteChannel>)
    }
}

pub struct FakeRemoteChannel {
    version: ProtocolVersion,
    handler: Mutex<Option<PipelineStateHandler>>,
    io: Mutex<Option<PipelineIo>>,
    invoke_calls: Mutex<Vec<Vec<PipelineSpec>>>,
    connect_calls: Mutex<Vec<Option<RemoteConnectInfo>>>,
    connect_behaviors: Mutex<Vec<String>>,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
    initializations: AtomicUsize,
}

impl FakeRemoteChannel {
    pub fn new(version: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self {
            version,
            handler: Mutex::new(None),
            io: Mutex::new(None),
            invoke_calls: Mutex::new(Vec::new()),
            connect_calls: Mutex::new(Vec::new()),
            connect_behaviors: Mutex::new(Vec::new()),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            initializations: AtomicUsize::new(0),
        })
    }

    /// Behaviors executed after a reconnect, one per pending statement.
    pub fn set_connect_behaviors(&self, behaviors: &[&str]) {
        *self.connect_behaviors.lock().unwrap() =
            behaviors.iter().map(ToString::to_string).collect();
    }

    pub fn invoke_calls(&self) -> Vec<Vec<PipelineSpec>> {
        self.invoke_calls.lock().unwrap().clone()
    }

    pub fn connect_calls(&self) -> Vec<Option<RemoteConnectInfo>> {
        self.connect_calls.lock().unwrap().clone()
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn initialize_count(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    fn fire(&self, info: PsInvocationStateInfo) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(info);
        }
    }

    /// Returns true when the behavior fired a terminal (or disconnecting)
    /// notification and execution must not continue.
    fn run_behavior(&self, behavior: &str) -> bool {
        if let Some(items) = behavior.strip_prefix("emit:") {
            let output = self
                .io
                .lock()
                .unwrap()
                .as_ref()
                .map(|io| io.output.clone());
            if let Some(output) = output {
                for item in items.split(',').filter(|item| !item.is_empty()) {
                    let _ = output.write(PsValue::String(item.to_string()));
                }
            }
            false
        } else if let Some(message) = behavior.strip_prefix("fail:") {
            self.fire(PsInvocationStateInfo::with_reason(
                PsInvocationState::Failed,
                PwshInvokeError::RemoteError(message.to_string()),
            ));
            true
        } else if behavior == "disconnect" {
            self.fire(PsInvocationStateInfo::new(PsInvocationState::Disconnected));
            true
        } else if behavior == "hold" {
            // stays running; only an external stop or disconnect ends it
            true
        } else {
            false
        }
    }
}

impl RemoteChannel for FakeRemoteChannel {
    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn initialize(
        &self,
        io: &PipelineIo,
        _settings: &InvocationSettings,
    ) -> Result<(), PwshInvokeError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        *self.io.lock().unwrap() = Some(io.clone());
        Ok(())
    }

    fn invoke_async(&self, statements: &[PipelineSpec]) -> Result<(), PwshInvokeError> {
        self.invoke_calls.lock().unwrap().push(statements.to_vec());
        for statement in statements {
            let behavior = statement
                .commands
                .first()
                .map(|command| command.command_text.clone())
                .unwrap_or_default();
            if self.run_behavior(&behavior) {
                return Ok(());
            }
        }
        self.fire(PsInvocationStateInfo::new(PsInvocationState::Completed));
        Ok(())
    }

    fn connect_async(
        &self,
        connect_info: Option<&RemoteConnectInfo>,
    ) -> Result<(), PwshInvokeError> {
        self.connect_calls
            .lock()
            .unwrap()
            .push(connect_info.cloned());
        self.fire(PsInvocationStateInfo::new(PsInvocationState::Running));
        let behaviors = self.connect_behaviors.lock().unwrap().clone();
        for behavior in behaviors {
            if self.run_behavior(&behavior) {
                return Ok(());
            }
        }
        self.fire(PsInvocationStateInfo::new(PsInvocationState::Completed));
        Ok(())
    }

    fn stop_async(&self) -> Result<(), PwshInvokeError> {
        self.fire(PsInvocationStateInfo::new(PsInvocationState::Stopped));
        Ok(())
    }

    fn suspend_receive(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_receive(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_state_changed(&self, handler: Option<PipelineStateHandler>) {
        *self.handler.lock().unwrap() = handler;
    }
}
