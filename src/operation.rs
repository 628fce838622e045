use std::{
    fmt,
    os::fd::RawFd,
    sync::{Arc, Weak},
    task::Waker,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    multiplexer::Shared, Awaitable, Capabilities, Deadline, Error, Handle, Multiplexer,
    RegisteredBuffer,
};

// file offsets are signed 64 bit values in every kernel interface we use
#[allow(clippy::cast_sign_loss)]
const MAX_OFFSET: u64 = i64::MAX as u64;

/// The kinds of write reordering barrier which can be requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// Start writing back dirty data without waiting for it
    NowaitDataOnly,
    /// Write back dirty data and wait until the device has it
    WaitDataOnly,
    /// Start writing back data and the metadata needed to retrieve it
    NowaitAll,
    /// Write back data and metadata and wait for both
    WaitAll,
}

/// What an operation asks the handle to do
///
/// Buffers are owned by the request for the whole lifetime of the operation,
/// reads transfer into the buffers' current lengths
#[derive(Debug)]
pub enum Request {
    Read {
        offset: u64,
        buffers: Vec<Vec<u8>>,
    },
    Write {
        offset: u64,
        buffers: Vec<Vec<u8>>,
    },
    Barrier {
        offset: u64,
        /// Zero meaning up to the end of the file
        length: u64,
        kind: BarrierKind,
    },
    /// Read the first `length` bytes of a registered buffer
    ReadRegistered {
        offset: u64,
        buffer: RegisteredBuffer,
        length: usize,
    },
    /// Write the first `length` bytes of a registered buffer
    WriteRegistered {
        offset: u64,
        buffer: RegisteredBuffer,
        length: usize,
    },
}

impl Request {
    pub const fn read(offset: u64, buffers: Vec<Vec<u8>>) -> Self {
        Self::Read { offset, buffers }
    }

    /// Read up to `length` bytes into a single freshly allocated buffer
    #[must_use]
    pub fn read_exact(offset: u64, length: usize) -> Self {
        Self::Read {
            offset,
            buffers: vec![vec![0; length]],
        }
    }

    pub const fn write(offset: u64, buffers: Vec<Vec<u8>>) -> Self {
        Self::Write { offset, buffers }
    }

    /// Read into the whole of a registered buffer
    #[must_use]
    pub fn read_registered(offset: u64, buffer: RegisteredBuffer) -> Self {
        let length = buffer.len();
        Self::ReadRegistered {
            offset,
            buffer,
            length,
        }
    }

    pub const fn write_registered(offset: u64, buffer: RegisteredBuffer, length: usize) -> Self {
        Self::WriteRegistered {
            offset,
            buffer,
            length,
        }
    }

    /// Barrier the whole file
    pub const fn barrier(kind: BarrierKind) -> Self {
        Self::Barrier {
            offset: 0,
            length: 0,
            kind,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Read { .. } | Self::ReadRegistered { .. } => OperationKind::Read,
            Self::Write { .. } | Self::WriteRegistered { .. } => OperationKind::Write,
            Self::Barrier { .. } => OperationKind::Barrier,
        }
    }

    fn requested(&self) -> usize {
        match self {
            Self::Read { buffers, .. } | Self::Write { buffers, .. } => {
                buffers.iter().map(Vec::len).sum()
            }
            Self::ReadRegistered { length, .. } | Self::WriteRegistered { length, .. } => *length,
            Self::Barrier { .. } => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    Barrier,
}

/// Lifecycle position of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Unsubmitted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Byte counts of a finished transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Completion {
    pub requested: usize,
    pub transferred: usize,
}

impl Completion {
    /// Whether fewer bytes moved than were asked for
    ///
    /// Short transfers are never retried by the multiplexer
    #[must_use]
    pub const fn is_short(&self) -> bool {
        self.transferred < self.requested
    }

    /// Turn a short transfer into an error
    ///
    /// # Errors
    ///
    /// [`Error::ShortTransfer`] if fewer bytes moved than requested
    pub const fn ensure_complete(self) -> Result<Self, Error> {
        if self.is_short() {
            return Err(Error::ShortTransfer {
                requested: self.requested,
                transferred: self.transferred,
            });
        }

        Ok(self)
    }
}

/// Terminal result of an operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed(Completion),
    Failed(Error),
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Completed(_) => Phase::Completed,
            Self::Failed(_) => Phase::Failed,
            Self::Cancelled => Phase::Cancelled,
        }
    }

    /// Collapse into a result, cancellation becoming [`Error::Cancelled`]
    ///
    /// # Errors
    ///
    /// If the operation failed or got cancelled
    pub fn into_result(self) -> Result<Completion, Error> {
        match self {
            Self::Completed(completion) => Ok(completion),
            Self::Failed(error) => Err(error),
            Self::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Progress of a cancellation request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelStatus {
    /// Queued, waiting for the backend to answer
    Pending,
    /// The operation ended up cancelled
    Acknowledged,
    /// The backend was too late, the natural result stands
    Refused,
}

/// Immediate answer to [`Operation::cancel`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cancellation {
    /// The request was queued, the operation turns cancelled once the backend
    /// acknowledges it
    Requested,
    /// The operation had already finished, nothing changed
    Finished(Outcome),
}

/// Backend result that moves an operation into its terminal phase
pub(crate) enum Resolution {
    Transferred(usize),
    Failed(Error),
    Cancelled,
}

/// Where an in-flight operation is registered
pub(crate) struct Registration {
    pub multiplexer: Weak<Shared>,
    pub key: usize,
}

/// Description of an issued transfer handed to a backend
///
/// The pointers reference the owning operation's buffers and scatter list
/// which stay untouched until the operation resolves
pub(crate) struct Submission {
    pub key: usize,
    pub fd: RawFd,
    pub pollable: bool,
    /// [`None`] for handles without a file position
    pub offset: Option<u64>,
    pub action: Action,
}

pub(crate) enum Action {
    /// `registered` marks a single vector covering a registered buffer
    Read {
        vectors: *const libc::iovec,
        count: usize,
        registered: bool,
    },
    Write {
        vectors: *const libc::iovec,
        count: usize,
        registered: bool,
    },
    Barrier {
        kind: BarrierKind,
        offset: u64,
        length: u64,
    },
}

// SAFETY: the pointed-to memory is owned by an operation kept alive by the
// multiplexer registry until the submission resolves
unsafe impl Send for Submission {}

/// Scatter list pointing into a request's buffers
#[derive(Default)]
struct IoVectors(Vec<libc::iovec>);

// SAFETY: only ever dereferenced by the kernel or the backend while the
// owning operation is in flight
unsafe impl Send for IoVectors {}

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

pub(crate) struct Inner {
    phase: Phase,
    request: Request,
    vectors: IoVectors,
    pub(crate) registration: Option<Registration>,
    outcome: Option<Outcome>,
    cancel: Option<CancelStatus>,
    waker: Option<Waker>,
    callback: Option<Callback>,
}

/// Everything that has to run once the operation lock is released
#[must_use]
pub(crate) struct Wakeup {
    outcome: Outcome,
    waker: Option<Waker>,
    callback: Option<Callback>,
}

impl Wakeup {
    pub fn run(self) {
        if let Some(waker) = self.waker {
            waker.wake();
        }

        if let Some(callback) = self.callback {
            callback(&self.outcome);
        }
    }
}

/// State shared between an [`Operation`] and the multiplexer driving it
pub(crate) struct OperationState {
    handle: Arc<Handle>,
    kind: OperationKind,
    inner: Mutex<Inner>,
    finished: Condvar,
}

impl OperationState {
    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Check the request against the handle and the current phase
    pub fn validate(&self, inner: &Inner) -> Result<(), Error> {
        if inner.phase != Phase::Unsubmitted {
            return Err(Error::InvalidArgument("operation was already submitted"));
        }

        let (offset, required, total) = match &inner.request {
            Request::Read { offset, buffers } => {
                (*offset, Capabilities::READABLE, self.scatter_length(buffers)?)
            }
            Request::Write { offset, buffers } => {
                (*offset, Capabilities::WRITABLE, self.scatter_length(buffers)?)
            }
            Request::ReadRegistered {
                offset,
                buffer,
                length,
            } => (*offset, Capabilities::READABLE, registered_length(buffer, *length)?),
            Request::WriteRegistered {
                offset,
                buffer,
                length,
            } => (*offset, Capabilities::WRITABLE, registered_length(buffer, *length)?),
            Request::Barrier { offset, length, .. } => {
                return match offset.checked_add(*length) {
                    Some(end) if end <= MAX_OFFSET => Ok(()),
                    _ => Err(Error::InvalidArgument(
                        "barrier range extends past the largest file offset",
                    )),
                };
            }
        };

        if !self.handle.capabilities().contains(required) {
            return Err(Error::InvalidArgument(if required == Capabilities::READABLE {
                "handle is not readable"
            } else {
                "handle is not writable"
            }));
        }

        match total.and_then(|total| offset.checked_add(total)) {
            Some(end) if end <= MAX_OFFSET => Ok(()),
            _ => Err(Error::InvalidArgument(
                "request extends past the largest file offset",
            )),
        }
    }

    /// Total length of a scatter list, [`None`] on overflow
    fn scatter_length(&self, buffers: &[Vec<u8>]) -> Result<Option<u64>, Error> {
        if buffers.is_empty() {
            return Err(Error::InvalidArgument("request carries no buffers"));
        }

        if buffers.len() > self.handle.max_buffers() {
            return Err(Error::InvalidArgument(
                "request carries more buffers than the handle accepts",
            ));
        }

        Ok(buffers.iter().try_fold(0u64, |total, buffer| {
            total.checked_add(u64::try_from(buffer.len()).ok()?)
        }))
    }

    /// Move into the in-progress phase after a successful registration
    pub fn begin(inner: &mut Inner, registration: Registration) {
        inner.phase = Phase::InProgress;
        inner.registration = Some(registration);
    }

    /// Describe the transfer for a backend, pointing into the owned buffers
    pub fn prepare(&self, key: usize) -> Submission {
        let capabilities = self.handle.capabilities();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (offset, action) = match &mut inner.request {
            Request::Read { offset, buffers } => {
                inner.vectors = IoVectors(
                    buffers
                        .iter_mut()
                        .map(|buffer| libc::iovec {
                            iov_base: buffer.as_mut_ptr().cast(),
                            iov_len: buffer.len(),
                        })
                        .collect(),
                );

                let action = Action::Read {
                    vectors: inner.vectors.0.as_ptr(),
                    count: inner.vectors.0.len(),
                    registered: false,
                };

                (*offset, action)
            }
            Request::Write { offset, buffers } => {
                inner.vectors = IoVectors(
                    buffers
                        .iter()
                        .map(|buffer| libc::iovec {
                            iov_base: buffer.as_ptr().cast_mut().cast(),
                            iov_len: buffer.len(),
                        })
                        .collect(),
                );

                let action = Action::Write {
                    vectors: inner.vectors.0.as_ptr(),
                    count: inner.vectors.0.len(),
                    registered: false,
                };

                (*offset, action)
            }
            Request::ReadRegistered {
                offset,
                buffer,
                length,
            } => {
                inner.vectors = IoVectors(vec![libc::iovec {
                    iov_base: buffer.mapping().address().cast(),
                    iov_len: *length,
                }]);

                let action = Action::Read {
                    vectors: inner.vectors.0.as_ptr(),
                    count: 1,
                    registered: true,
                };

                (*offset, action)
            }
            Request::WriteRegistered {
                offset,
                buffer,
                length,
            } => {
                inner.vectors = IoVectors(vec![libc::iovec {
                    iov_base: buffer.mapping().address().cast(),
                    iov_len: *length,
                }]);

                let action = Action::Write {
                    vectors: inner.vectors.0.as_ptr(),
                    count: 1,
                    registered: true,
                };

                (*offset, action)
            }
            Request::Barrier {
                offset,
                length,
                kind,
            } => (
                *offset,
                Action::Barrier {
                    kind: *kind,
                    offset: *offset,
                    length: *length,
                },
            ),
        };

        Submission {
            key,
            fd: self.handle.native_descriptor(),
            pollable: capabilities.contains(Capabilities::POLLABLE),
            offset: capabilities
                .contains(Capabilities::SEEKABLE)
                .then_some(offset),
            action,
        }
    }

    /// Record the terminal result, returning the notifications to deliver
    /// once the lock is released
    ///
    /// Returns [`None`] when the operation already reached a terminal phase
    pub fn resolve(&self, inner: &mut Inner, resolution: Resolution) -> Option<Wakeup> {
        if inner.outcome.is_some() {
            return None;
        }

        let requested = inner.request.requested();
        let outcome = match resolution {
            Resolution::Transferred(transferred) => {
                if let Request::Read { buffers, .. } = &mut inner.request {
                    truncate_to_filled(buffers, transferred);
                }

                Outcome::Completed(Completion {
                    requested,
                    transferred,
                })
            }
            Resolution::Failed(error) => Outcome::Failed(error),
            Resolution::Cancelled => Outcome::Cancelled,
        };

        inner.cancel = match (inner.cancel, &outcome) {
            (Some(_), Outcome::Cancelled) => Some(CancelStatus::Acknowledged),
            (Some(CancelStatus::Pending), _) => Some(CancelStatus::Refused),
            (status, _) => status,
        };

        inner.vectors = IoVectors::default();
        inner.phase = outcome.phase();
        inner.outcome = Some(outcome.clone());
        self.finished.notify_all();

        Some(Wakeup {
            outcome,
            waker: inner.waker.take(),
            callback: inner.callback.take(),
        })
    }

    /// Resolve while taking the lock, delivering notifications afterwards
    pub fn finish(&self, resolution: Resolution) {
        let wakeup = self.resolve(&mut self.inner.lock(), resolution);

        if let Some(wakeup) = wakeup {
            wakeup.run();
        }
    }

    /// The backend turned down a cancellation request
    pub fn cancel_refused(&self) {
        let mut inner = self.inner.lock();

        if inner.outcome.is_none() && inner.cancel == Some(CancelStatus::Pending) {
            inner.cancel = Some(CancelStatus::Refused);
        }
    }

    /// Wake threads sleeping in [`Operation::wait`] so they re-check the
    /// multiplexer
    pub fn nudge(&self) {
        let _inner = self.inner.lock();
        self.finished.notify_all();
    }

    /// Terminal result, or the waker is stored to be woken once there is one
    pub fn poll_outcome(&self, waker: &Waker) -> Option<Outcome> {
        let mut inner = self.inner.lock();

        if let Some(outcome) = &inner.outcome {
            return Some(outcome.clone());
        }

        match &mut inner.waker {
            Some(stored) if stored.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }

        None
    }
}

fn registered_length(buffer: &RegisteredBuffer, length: usize) -> Result<Option<u64>, Error> {
    if length == 0 || length > buffer.len() {
        return Err(Error::InvalidArgument(
            "registered request length is outside its buffer",
        ));
    }

    Ok(u64::try_from(length).ok())
}

/// Fill buffers front to back, shrinking each to what it received
fn truncate_to_filled(buffers: &mut [Vec<u8>], transferred: usize) {
    let mut remaining = transferred;

    for buffer in buffers {
        let filled = buffer.len().min(remaining);
        buffer.truncate(filled);
        remaining -= filled;
    }
}

/// A single read, write or barrier and its lifecycle
///
/// The submitter owns the operation, the multiplexer only keeps it alive
/// while the OS may still touch its buffers. Dropping an in-flight operation
/// does not cancel it
pub struct Operation {
    pub(crate) state: Arc<OperationState>,
}

impl Operation {
    pub fn new(handle: &Arc<Handle>, request: Request) -> Self {
        Self {
            state: Arc::new(OperationState {
                handle: handle.clone(),
                kind: request.kind(),
                inner: Mutex::new(Inner {
                    phase: Phase::Unsubmitted,
                    request,
                    vectors: IoVectors::default(),
                    registration: None,
                    outcome: None,
                    cancel: None,
                    waker: None,
                    callback: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    /// Validate and register with a multiplexer, see [`Multiplexer::submit`]
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a malformed request or a handle not
    /// registered with the multiplexer
    pub fn submit(&self, multiplexer: &Multiplexer) -> Result<(), Error> {
        multiplexer.submit(self)
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.state.kind
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<Handle> {
        &self.state.handle
    }

    /// Current phase, never blocks
    #[must_use]
    pub fn poll(&self) -> Phase {
        self.state.inner.lock().phase
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.poll().is_terminal()
    }

    /// Terminal result if there is one
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.state.inner.lock().outcome.clone()
    }

    #[must_use]
    pub fn cancel_status(&self) -> Option<CancelStatus> {
        self.state.inner.lock().cancel
    }

    /// Block until the operation is terminal or the deadline expires
    ///
    /// The calling thread helps drive the owning multiplexer when the
    /// scheduling model allows it, otherwise it sleeps until another thread
    /// resolves the operation
    ///
    /// # Errors
    ///
    /// [`Error::TimedOut`] once the deadline expires, the operation stays in
    /// progress. [`Error::InvalidArgument`] if it was never submitted,
    /// [`Error::Broken`] if the multiplexer failed or went away
    pub fn wait(&self, deadline: Deadline) -> Result<Outcome, Error> {
        let expiry = deadline.start();

        loop {
            let multiplexer = {
                let inner = self.state.inner.lock();

                if let Some(outcome) = &inner.outcome {
                    return Ok(outcome.clone());
                }

                let Some(registration) = &inner.registration else {
                    return Err(Error::InvalidArgument("operation was never submitted"));
                };

                registration.multiplexer.upgrade()
            };

            if expiry.is_expired() {
                return Err(Error::TimedOut);
            }

            let Some(shared) = multiplexer else {
                return Err(Error::Broken("multiplexer was dropped".to_owned()));
            };

            if let Some(error) = shared.broken() {
                return Err(error);
            }

            if shared.may_drive() {
                match shared.run_once(&expiry) {
                    Ok(_) | Err(Error::TimedOut) => continue,
                    Err(error) => return Err(error),
                }
            }

            drop(shared);

            let mut inner = self.state.inner.lock();
            if inner.outcome.is_none() {
                match expiry.instant() {
                    Some(instant) => _ = self.state.finished.wait_until(&mut inner, instant),
                    None => self.state.finished.wait(&mut inner),
                }
            }
        }
    }

    /// Request cancellation without blocking
    ///
    /// Cancelling a terminal operation changes nothing and hands back its
    /// result. An operation that was never submitted turns cancelled right
    /// away
    ///
    /// # Errors
    ///
    /// [`Error::CannotCancel`] when the backend can't cancel the issued
    /// operation, [`Error::Broken`] when the multiplexer is gone
    pub fn cancel(&self) -> Result<Cancellation, Error> {
        let mut inner = self.state.inner.lock();

        if let Some(outcome) = &inner.outcome {
            return Ok(Cancellation::Finished(outcome.clone()));
        }

        match inner.cancel {
            Some(CancelStatus::Pending) => return Ok(Cancellation::Requested),
            Some(CancelStatus::Refused) => return Err(Error::CannotCancel),
            _ => {}
        }

        let registration = inner
            .registration
            .as_ref()
            .map(|registration| (registration.key, registration.multiplexer.upgrade()));

        let Some((key, multiplexer)) = registration else {
            inner.cancel = Some(CancelStatus::Pending);
            let wakeup = self.state.resolve(&mut inner, Resolution::Cancelled);
            drop(inner);

            if let Some(wakeup) = wakeup {
                wakeup.run();
            }

            return Ok(Cancellation::Finished(Outcome::Cancelled));
        };

        let Some(shared) = multiplexer else {
            return Err(Error::Broken("multiplexer was dropped".to_owned()));
        };

        shared.request_cancel(key, &self.state)?;
        inner.cancel = Some(CancelStatus::Pending);
        drop(inner);

        shared.notify();
        Ok(Cancellation::Requested)
    }

    /// Run a callback once the operation is terminal, right away if it
    /// already is
    ///
    /// Replaces any callback registered earlier. The callback runs on
    /// whichever thread resolves the operation
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut inner = self.state.inner.lock();
        let outcome = inner.outcome.clone();

        match outcome {
            Some(outcome) => {
                drop(inner);
                callback(&outcome);
            }
            None => inner.callback = Some(Box::new(callback)),
        }
    }

    /// Hand back the buffers once the operation is terminal
    ///
    /// Read buffers are shrunk to the bytes they received. Returns [`None`]
    /// while the operation may still touch them
    #[must_use]
    pub fn take_buffers(&self) -> Option<Vec<Vec<u8>>> {
        let mut inner = self.state.inner.lock();

        if inner.outcome.is_none() && inner.phase != Phase::Unsubmitted {
            return None;
        }

        match &mut inner.request {
            Request::Read { buffers, .. } | Request::Write { buffers, .. } => {
                Some(std::mem::take(buffers))
            }
            Request::Barrier { .. }
            | Request::ReadRegistered { .. }
            | Request::WriteRegistered { .. } => Some(Vec::new()),
        }
    }

    /// Hand back the registered buffer of a terminal operation
    ///
    /// Unlike heap buffers it keeps its full length, the completion tells
    /// how many bytes were transferred
    #[must_use]
    pub fn take_registered_buffer(&self) -> Option<RegisteredBuffer> {
        let mut inner = self.state.inner.lock();

        if inner.outcome.is_none() && inner.phase != Phase::Unsubmitted {
            return None;
        }

        let emptied = match &inner.request {
            Request::ReadRegistered { offset, .. } => Request::Read {
                offset: *offset,
                buffers: Vec::new(),
            },
            Request::WriteRegistered { offset, .. } => Request::Write {
                offset: *offset,
                buffers: Vec::new(),
            },
            _ => return None,
        };

        match std::mem::replace(&mut inner.request, emptied) {
            Request::ReadRegistered { buffer, .. } | Request::WriteRegistered { buffer, .. } => {
                Some(buffer)
            }
            _ => None,
        }
    }

    /// Adapter for awaiting this operation from a cooperative task
    pub fn into_awaitable(self) -> Awaitable {
        Awaitable::new(self)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();

        formatter
            .debug_struct("Operation")
            .field("kind", &self.state.kind)
            .field("handle", &self.state.handle.id())
            .field("phase", &inner.phase)
            .field("cancel", &inner.cancel)
            .finish_non_exhaustive()
    }
}
