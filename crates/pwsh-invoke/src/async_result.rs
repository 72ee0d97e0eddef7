use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::pipeline::PsValue;
use crate::streams::DataStream;
use crate::PwshInvokeError;

/// Which end-style call a handle may be redeemed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncResultKind {
    Invoke,
    Stop,
}

pub type AsyncResultCallback = Arc<dyn Fn(&AsyncResult) + Send + Sync>;

/// Completion handle for a pending invoke or stop operation.
///
/// Completion is exactly-once: the first `set_completed` wins, later calls
/// are no-ops. The triggering callback runs after the wait handle is
/// signaled, outside any internal lock.
#[derive(Clone)]
pub struct AsyncResult {
    inner: Arc<Inner>,
}

struct Inner {
    owner: Uuid,
    operation: Uuid,
    kind: AsyncResultKind,
    callback: Mutex<Option<AsyncResultCallback>>,
    output: Mutex<Option<DataStream<PsValue>>>,
    completion: Mutex<Completion>,
    completed_cond: Condvar,
}

struct Completion {
    completed: bool,
    reason: Option<PwshInvokeError>,
}

impl AsyncResult {
    pub(crate) fn new(
        owner: Uuid,
        kind: AsyncResultKind,
        callback: Option<AsyncResultCallback>,
        output: Option<DataStream<PsValue>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner,
                operation: Uuid::new_v4(),
                kind,
                callback: Mutex::new(callback),
                output: Mutex::new(output),
                completion: Mutex::new(Completion {
                    completed: false,
                    reason: None,
                }),
                completed_cond: Condvar::new(),
            }),
        }
    }

    /// Identity of the instance that created this handle. End-style calls on
    /// a foreign instance must be rejected as usage errors.
    pub fn owner(&self) -> Uuid {
        self.inner.owner
    }

    /// Unique id of the underlying operation; two handles for the same
    /// pending operation share it.
    pub fn operation_id(&self) -> Uuid {
        self.inner.operation
    }

    pub fn kind(&self) -> AsyncResultKind {
        self.inner.kind
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completion.lock().unwrap().completed
    }

    /// The output buffer attached to an invoke-flavored handle.
    pub fn output(&self) -> Option<DataStream<PsValue>> {
        self.inner.output.lock().unwrap().clone()
    }

    /// Block until the operation completes. Returns the failure reason the
    /// operation completed with, if any.
    pub fn wait(&self) -> Result<(), PwshInvokeError> {
        let mut completion = self.inner.completion.lock().unwrap();
        while !completion.completed {
            completion = self.inner.completed_cond.wait(completion).unwrap();
        }
        match &completion.reason {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    /// Signal completion. Returns false when the handle was already
    /// completed; the second signal changes nothing observable.
    pub(crate) fn set_completed(&self, reason: Option<PwshInvokeError>) -> bool {
        let callback = {
            let mut completion = self.inner.completion.lock().unwrap();
            if completion.completed {
                debug!(operation = %self.inner.operation, "ignoring duplicate completion");
                return false;
            }
            completion.completed = true;
            completion.reason = reason;
            self.inner.completed_cond.notify_all();
            self.inner.callback.lock().unwrap().take()
        };

        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    /// Early release for an internal error path: unblock any waiter without
    /// running the user callback, so a handle that will never be awaited is
    /// not leaked. Idempotent.
    pub(crate) fn release(&self) {
        let mut completion = self.inner.completion.lock().unwrap();
        if completion.completed {
            return;
        }
        completion.completed = true;
        self.inner.callback.lock().unwrap().take();
        self.inner.completed_cond.notify_all();
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("owner", &self.inner.owner)
            .field("operation", &self.inner.operation)
            .field("kind", &self.inner.kind)
            .field("completed", &self.is_completed())
            .finish()
    }
}
