use std::sync::{Arc, Mutex};

use crate::PwshInvokeError;

/// Thread-safe append-only buffer with an open/closed latch.
///
/// Cloning the handle shares the underlying buffer. Closing is idempotent;
/// writing after close is an error so a finished pipeline cannot keep
/// mutating caller-visible data.
#[derive(Debug)]
pub struct DataStream<T> {
    inner: Arc<StreamInner<T>>,
}

#[derive(Debug)]
struct StreamInner<T> {
    state: Mutex<StreamState<T>>,
}

#[derive(Debug)]
struct StreamState<T> {
    items: Vec<T>,
    open: bool,
}

impl<T> Clone for DataStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DataStream<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    items: Vec::new(),
                    open: true,
                }),
            }),
        }
    }

    pub fn write(&self, item: T) -> Result<(), PwshInvokeError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.open {
            return Err(PwshInvokeError::InvalidState(
                "cannot write to a closed stream",
            ));
        }
        state.items.push(item);
        Ok(())
    }

    pub fn close(&self) {
        self.inner.state.lock().unwrap().open = false;
    }

    /// Re-arm a closed stream for the next invocation of its owner.
    pub(crate) fn reopen(&self) {
        self.inner.state.lock().unwrap().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().unwrap().open
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything buffered so far.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.inner.state.lock().unwrap();
        std::mem::take(&mut state.items)
    }

    /// True when both handles view the same underlying buffer.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> DataStream<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.state.lock().unwrap().items.clone()
    }
}

impl<T> Default for DataStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-terminating error surfaced by a statement or pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub message: String,
    pub error_id: String,
}

impl From<&PwshInvokeError> for ErrorRecord {
    fn from(error: &PwshInvokeError) -> Self {
        Self {
            message: error.to_string(),
            error_id: "InvocationError".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub activity: String,
    pub status_description: String,
    pub percent_complete: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationRecord {
    pub message_data: String,
    pub source: String,
}

/// The informational streams of one invocation, in business terms.
///
/// Cloning shares the underlying buffers, so the facade, the worker and the
/// caller all observe the same data.
#[derive(Debug, Clone)]
pub struct PsDataStreams {
    pub error: DataStream<ErrorRecord>,
    pub progress: DataStream<ProgressRecord>,
    pub verbose: DataStream<String>,
    pub debug: DataStream<String>,
    pub warning: DataStream<String>,
    pub information: DataStream<InformationRecord>,
}

impl PsDataStreams {
    pub fn new() -> Self {
        Self {
            error: DataStream::new(),
            progress: DataStream::new(),
            verbose: DataStream::new(),
            debug: DataStream::new(),
            warning: DataStream::new(),
            information: DataStream::new(),
        }
    }

    pub(crate) fn close_all(&self) {
        self.error.close();
        self.progress.close();
        self.verbose.close();
        self.debug.close();
        self.warning.close();
        self.information.close();
    }

    /// The informational streams outlive one invocation; starting the next
    /// one re-arms them.
    pub(crate) fn reopen_all(&self) {
        self.error.reopen();
        self.progress.reopen();
        self.verbose.reopen();
        self.debug.reopen();
        self.warning.reopen();
        self.information.reopen();
    }
}

impl Default for PsDataStreams {
    fn default() -> Self {
        Self::new()
    }
}
