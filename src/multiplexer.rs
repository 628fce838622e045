use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use slab::Slab;

use crate::{
    backend::{self, Backend, Reaped},
    buffer::Mapping,
    deadline::Expiry,
    notify::Notifier,
    operation::{OperationState, Registration, Resolution},
    Capabilities, Completion, Config, Deadline, Error, Handle, Operation, Outcome,
    RegisteredBuffer, Request, SchedulingModel,
};

static NEXT_MULTIPLEXER_ID: AtomicU64 = AtomicU64::new(1);

/// How long dropping a multiplexer waits for the OS to give back buffers
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct HandleEntry {
    handle: Weak<Handle>,
    in_flight: usize,
}

#[derive(Default)]
struct Registry {
    operations: Slab<Arc<OperationState>>,
    /// Registered but not yet handed to the backend
    pending: Vec<usize>,
    cancels: Vec<(usize, Arc<OperationState>)>,
    /// Buffers to hand to the backend on the next pass
    registrations: Vec<Arc<Mapping>>,
    handles: HashMap<u64, HandleEntry>,
    /// Bumped whenever operations resolve or a driver is woken
    generation: u64,
    broken: Option<Error>,
    driver: Option<ThreadId>,
}

impl Registry {
    fn holds(&self, key: usize, state: &Arc<OperationState>) -> bool {
        self.operations
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(registered, state))
    }

    fn remove(&mut self, key: usize) -> Option<Arc<OperationState>> {
        let state = self.operations.try_remove(key)?;

        if let Some(entry) = self.handles.get_mut(&state.handle().id()) {
            entry.in_flight -= 1;
        }

        Some(state)
    }
}

pub(crate) struct Shared {
    id: u64,
    config: Config,
    backend_name: &'static str,
    cancellable: bool,
    registry: Mutex<Registry>,
    /// Signalled whenever a driver finishes a pass
    progress: Condvar,
    backend: Mutex<Box<dyn Backend>>,
    notifier: Arc<Notifier>,
}

impl Shared {
    pub fn notify(&self) {
        if let Err(error) = self.notifier.notify() {
            tracing::warn!(multiplexer = self.id, %error, "failed to notify backend");
        }
    }

    pub fn broken(&self) -> Option<Error> {
        self.registry.lock().broken.clone()
    }

    /// Whether the calling thread is allowed to run passes
    pub fn may_drive(&self) -> bool {
        match self.config.model {
            SchedulingModel::Parallel => true,
            SchedulingModel::Cooperative => self
                .registry
                .lock()
                .driver
                .map_or(true, |driver| driver == thread::current().id()),
        }
    }

    fn bind_driver(&self, registry: &mut Registry) -> Result<(), Error> {
        if self.config.model == SchedulingModel::Parallel {
            return Ok(());
        }

        let current = thread::current().id();
        match registry.driver {
            Some(driver) if driver == current => Ok(()),
            Some(_) => Err(Error::InvalidArgument(
                "cooperative multiplexer is driven by another thread",
            )),
            None => {
                tracing::debug!(multiplexer = self.id, thread = ?current, "bound driver thread");
                registry.driver = Some(current);
                Ok(())
            }
        }
    }

    /// Queue a cancellation, called with the operation locked
    pub fn request_cancel(&self, key: usize, state: &Arc<OperationState>) -> Result<(), Error> {
        let mut registry = self.registry.lock();

        if let Some(error) = &registry.broken {
            return Err(error.clone());
        }

        // already claimed by a driver, its result is about to land
        if !registry.holds(key, state) {
            return Ok(());
        }

        if !self.cancellable && !registry.pending.contains(&key) {
            return Err(Error::CannotCancel);
        }

        registry.cancels.push((key, state.clone()));
        Ok(())
    }

    fn resolve(&self, key: usize, resolution: Resolution) -> usize {
        let Some(state) = self.registry.lock().remove(key) else {
            return 0;
        };

        state.finish(resolution);
        1
    }

    /// One pass, see [`Multiplexer::run_once`]
    pub fn run_once(&self, expiry: &Expiry) -> Result<usize, Error> {
        let mut registry = self.registry.lock();
        let generation = registry.generation;
        let mut reaped = Vec::new();

        loop {
            if let Some(error) = &registry.broken {
                return Err(error.clone());
            }

            self.bind_driver(&mut registry)?;

            if registry.operations.is_empty() || registry.generation != generation {
                return Ok(0);
            }

            let Some(backend) = self.backend.try_lock() else {
                if expiry.is_expired() {
                    return Err(Error::TimedOut);
                }

                match expiry.instant() {
                    Some(instant) => _ = self.progress.wait_until(&mut registry, instant),
                    None => self.progress.wait(&mut registry),
                }

                continue;
            };

            let resolved = self.poll(registry, backend, expiry, &mut reaped);

            registry = self.registry.lock();
            if matches!(resolved, Ok(count) if count > 0) {
                registry.generation += 1;
            }
            self.progress.notify_all();

            match resolved {
                Ok(0) if expiry.is_expired() => return Err(Error::TimedOut),
                Ok(0) => {}
                Ok(resolved) => return Ok(resolved),
                Err(error) => {
                    drop(registry);
                    return Err(self.break_down(error));
                }
            }
        }
    }

    /// Issue, cancel and reap while owning the backend
    fn poll(
        &self,
        mut registry: MutexGuard<'_, Registry>,
        mut backend: MutexGuard<'_, Box<dyn Backend>>,
        expiry: &Expiry,
        reaped: &mut Vec<Reaped>,
    ) -> Result<usize, Error> {
        let queued = std::mem::take(&mut registry.pending);
        let mut pending: Vec<(usize, Arc<OperationState>)> = queued
            .into_iter()
            .filter_map(|key| Some((key, registry.operations.get(key)?.clone())))
            .collect();
        let cancels = std::mem::take(&mut registry.cancels);
        let registrations = std::mem::take(&mut registry.registrations);
        drop(registry);

        for mapping in registrations {
            if let Err(error) = backend.register_buffer(&mapping) {
                tracing::debug!(multiplexer = self.id, %error, "failed to register buffer");
            }
        }

        let mut immediate = Vec::new();

        for (key, state) in cancels {
            if let Some(index) = pending.iter().position(|(pending, _)| *pending == key) {
                pending.swap_remove(index);
                immediate.push((key, Resolution::Cancelled));
            } else if self.registry.lock().holds(key, &state) {
                if let Err(error) = backend.cancel(key) {
                    tracing::debug!(key, %error, "backend refused cancellation");
                    state.cancel_refused();
                }
            }
        }

        for (key, state) in pending {
            let submission = state.prepare(key);

            // SAFETY: the registry keeps the operation and its buffers alive
            // until the key resolves
            if let Err(error) = unsafe { backend.issue(submission) } {
                immediate.push((key, Resolution::Failed(error)));
            }
        }

        let timeout = if immediate.is_empty() {
            expiry.remaining()
        } else {
            Some(Duration::ZERO)
        };

        let result = backend.reap(timeout, reaped);
        drop(backend);

        let mut resolved = 0;

        for (key, resolution) in immediate {
            resolved += self.resolve(key, resolution);
        }

        result?;

        for item in reaped.drain(..) {
            match item {
                Reaped::Finished { key, result } => {
                    let resolution = match result {
                        Ok(transferred) => Resolution::Transferred(transferred),
                        Err(error) => Resolution::Failed(error),
                    };

                    resolved += self.resolve(key, resolution);
                }
                Reaped::Cancelled { key } => resolved += self.resolve(key, Resolution::Cancelled),
                Reaped::CancelRefused { key } => {
                    let state = self.registry.lock().operations.get(key).cloned();
                    if let Some(state) = state {
                        state.cancel_refused();
                    }
                }
            }
        }

        if resolved > 0 {
            tracing::trace!(multiplexer = self.id, resolved, "resolved batch");
        }

        Ok(resolved)
    }

    /// Mark the multiplexer unusable and wake everyone waiting on it
    fn break_down(&self, error: Error) -> Error {
        let error = match error {
            Error::Broken(_) => error,
            other => Error::Broken(other.to_string()),
        };

        tracing::warn!(multiplexer = self.id, %error, "backend failed");

        let states: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.broken = Some(error.clone());
            registry.generation += 1;
            self.progress.notify_all();
            registry.operations.iter().map(|(_, state)| state.clone()).collect()
        };

        for state in states {
            state.nudge();
        }

        error
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();

        for (_, entry) in registry.handles.drain() {
            if let Some(handle) = entry.handle.upgrade() {
                handle.unbind(self.id);
            }
        }

        for key in std::mem::take(&mut registry.pending) {
            if let Some(state) = registry.operations.try_remove(key) {
                state.finish(Resolution::Cancelled);
            }
        }

        let backend = self.backend.get_mut();

        if backend.supports_cancellation() {
            for key in registry.operations.iter().map(|(key, _)| key) {
                _ = backend.cancel(key);
            }
        }

        let expiry = Deadline::after(DRAIN_TIMEOUT).start();
        let mut reaped = Vec::new();

        while !registry.operations.is_empty() && !expiry.is_expired() {
            if let Err(error) = backend.reap(expiry.remaining(), &mut reaped) {
                tracing::warn!(multiplexer = self.id, %error, "failed draining backend");
                break;
            }

            for item in reaped.drain(..) {
                let (key, resolution) = match item {
                    Reaped::Finished { key, result } => (
                        key,
                        match result {
                            Ok(transferred) => Resolution::Transferred(transferred),
                            Err(error) => Resolution::Failed(error),
                        },
                    ),
                    Reaped::Cancelled { key } => (key, Resolution::Cancelled),
                    Reaped::CancelRefused { .. } => continue,
                };

                if let Some(state) = registry.operations.try_remove(key) {
                    state.finish(resolution);
                }
            }
        }

        if !registry.operations.is_empty() {
            tracing::warn!(
                multiplexer = self.id,
                count = registry.operations.len(),
                "leaking operations the OS never released"
            );

            for state in registry.operations.drain() {
                std::mem::forget(state);
            }
        }

        tracing::debug!(multiplexer = self.id, "dropped multiplexer");
    }
}

/// Drives operations on registered handles through one OS mechanism
///
/// Clones share the same registry and backend. The last clone to go away
/// cancels whatever is still in flight and waits briefly for the OS to let
/// go of the buffers
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Open a multiplexer with the backend and scheduling model requested
    ///
    /// # Errors
    ///
    /// If the backend or its notifier can't be created
    pub fn new(config: Config) -> Result<Self, Error> {
        let notifier = Arc::new(Notifier::new()?);
        let backend = backend::open(&config, &notifier)?;
        Ok(Self::with_backend(config, notifier, backend))
    }

    fn with_backend(config: Config, notifier: Arc<Notifier>, backend: Box<dyn Backend>) -> Self {
        let id = NEXT_MULTIPLEXER_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            multiplexer = id,
            backend = backend.name(),
            model = ?config.model,
            "opened multiplexer"
        );

        Self {
            shared: Arc::new(Shared {
                id,
                config,
                backend_name: backend.name(),
                cancellable: backend.supports_cancellation(),
                registry: Mutex::new(Registry::default()),
                progress: Condvar::new(),
                backend: Mutex::new(backend),
                notifier,
            }),
        }
    }

    /// Open a multiplexer configured through the environment
    ///
    /// # Errors
    ///
    /// If a variable is malformed or the backend can't be created
    pub fn from_env() -> Result<Self, Error> {
        Self::new(Config::from_env()?)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn model(&self) -> SchedulingModel {
        self.shared.config.model
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend_name
    }

    /// Operations submitted and not yet resolved
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.registry.lock().operations.len()
    }

    /// Associate a handle so operations on it may be submitted here
    ///
    /// Registering the same handle again is a no-op. Pollable descriptors
    /// are switched into non-blocking mode
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRegistered`] if another multiplexer owns the handle
    pub fn register_handle(&self, handle: &Arc<Handle>) -> Result<(), Error> {
        let id = self.shared.id;
        let fresh = handle.multiplexer() != Some(id);

        if let Err(owner) = handle.bind(id) {
            tracing::debug!(multiplexer = id, owner, handle = handle.id(), "handle owned elsewhere");
            return Err(Error::AlreadyRegistered);
        }

        if handle.capabilities().contains(Capabilities::POLLABLE) {
            if let Err(error) = handle.make_non_blocking() {
                if fresh {
                    handle.unbind(id);
                }

                return Err(error.into());
            }
        }

        let mut registry = self.shared.registry.lock();

        // handles dropped without deregistering leave dead entries behind
        registry
            .handles
            .retain(|_, entry| entry.in_flight > 0 || entry.handle.strong_count() > 0);

        registry
            .handles
            .entry(handle.id())
            .or_insert_with(|| HandleEntry {
                handle: Arc::downgrade(handle),
                in_flight: 0,
            });
        drop(registry);

        if fresh {
            tracing::debug!(multiplexer = id, handle = handle.id(), "registered handle");
        }

        Ok(())
    }

    /// Release a handle so it may be registered elsewhere
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the handle isn't registered here or
    /// still has operations in flight
    pub fn deregister_handle(&self, handle: &Handle) -> Result<(), Error> {
        let mut registry = self.shared.registry.lock();

        match registry.handles.get(&handle.id()) {
            None => Err(Error::InvalidArgument(
                "handle is not registered with this multiplexer",
            )),
            Some(entry) if entry.in_flight > 0 => {
                Err(Error::InvalidArgument("handle has operations in flight"))
            }
            Some(_) => {
                registry.handles.remove(&handle.id());
                handle.unbind(self.shared.id);
                tracing::debug!(multiplexer = self.shared.id, handle = handle.id(), "deregistered handle");
                Ok(())
            }
        }
    }

    /// Register an operation for dispatch, never blocks
    ///
    /// Registration is atomic, a later pass of [`Multiplexer::run_once`] on
    /// any thread hands it to the OS. No ordering holds between operations,
    /// even on the same handle the device decides what lands first
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for malformed requests, operations that
    /// were submitted before or handles registered elsewhere
    pub fn submit(&self, operation: &Operation) -> Result<(), Error> {
        let state = &operation.state;
        let mut inner = state.lock();
        state.validate(&inner)?;

        let handle = state.handle().id();

        {
            let mut registry = self.shared.registry.lock();

            if let Some(error) = &registry.broken {
                return Err(error.clone());
            }

            let Some(entry) = registry.handles.get_mut(&handle) else {
                return Err(Error::InvalidArgument(
                    "handle is not registered with this multiplexer",
                ));
            };

            entry.in_flight += 1;
            let key = registry.operations.insert(state.clone());
            registry.pending.push(key);

            OperationState::begin(
                &mut inner,
                Registration {
                    multiplexer: Arc::downgrade(&self.shared),
                    key,
                },
            );

            tracing::trace!(multiplexer = self.shared.id, handle, key, kind = ?state.kind(), "submitted");
        }

        drop(inner);
        self.shared.notify();
        Ok(())
    }

    /// Run a single pass on the calling thread
    ///
    /// Blocks until at least one operation resolves, on this thread or on
    /// another one, then resolves everything the backend reported ready at
    /// that wake-up. Returns the number resolved by this call, zero when
    /// nothing is in flight, another thread made progress or
    /// [`Multiplexer::wake`] was called
    ///
    /// # Errors
    ///
    /// [`Error::TimedOut`] if the deadline expires without anything
    /// resolving, [`Error::InvalidArgument`] from a foreign thread on a
    /// cooperative multiplexer, [`Error::Broken`] once the backend failed
    pub fn run_once(&self, deadline: Deadline) -> Result<usize, Error> {
        self.shared.run_once(&deadline.start())
    }

    /// Run passes until nothing is in flight, returning how many operations
    /// this thread resolved
    ///
    /// # Errors
    ///
    /// As for [`Multiplexer::run_once`]
    pub fn run_until(&self, deadline: Deadline) -> Result<usize, Error> {
        let expiry = deadline.start();
        let mut total = 0;

        while self.in_flight() > 0 {
            total += self.shared.run_once(&expiry)?;
        }

        Ok(total)
    }

    /// Allocate a page aligned buffer and register it with the backend
    ///
    /// Registration happens on the next pass and only where the backend
    /// supports it, e.g. `io_uring` fixed buffers. Operations submitted with
    /// [`Request::read_registered`] or [`Request::write_registered`] then
    /// skip per-transfer page pinning
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for zero bytes, or whatever the OS
    /// reports when mapping memory fails
    pub fn allocate_registered_buffer(&self, bytes: usize) -> Result<RegisteredBuffer, Error> {
        let buffer = RegisteredBuffer::allocate(bytes)?;

        {
            let mut registry = self.shared.registry.lock();

            if let Some(error) = &registry.broken {
                return Err(error.clone());
            }

            registry.registrations.push(buffer.mapping().clone());
        }

        tracing::trace!(
            multiplexer = self.shared.id,
            length = buffer.len(),
            "allocated registered buffer"
        );

        self.shared.notify();
        Ok(buffer)
    }

    /// Make a blocked [`Multiplexer::run_once`] return early
    pub fn wake(&self) {
        {
            let mut registry = self.shared.registry.lock();
            registry.generation += 1;
            self.shared.progress.notify_all();
        }

        self.shared.notify();
    }

    /// Perform a request to completion, blocking the calling thread
    ///
    /// On expiry the operation is cancelled and its acknowledgement awaited
    /// before [`Error::TimedOut`] is returned. Should the transfer finish
    /// before the cancellation lands, its result is returned instead
    ///
    /// # Errors
    ///
    /// Submission failures, the operation's own failure, or
    /// [`Error::TimedOut`]
    pub fn execute(
        &self,
        handle: &Arc<Handle>,
        request: Request,
        deadline: Deadline,
    ) -> Result<(Completion, Vec<Vec<u8>>), Error> {
        let operation = Operation::new(handle, request);
        self.submit(&operation)?;

        let outcome = match operation.wait(deadline) {
            Ok(outcome) => outcome,
            Err(Error::TimedOut) => match operation.cancel() {
                Ok(_) => match operation.wait(Deadline::NEVER)? {
                    Outcome::Cancelled => return Err(Error::TimedOut),
                    outcome => outcome,
                },
                Err(Error::CannotCancel) => return Err(Error::TimedOut),
                Err(error) => return Err(error),
            },
            Err(error) => return Err(error),
        };

        let completion = outcome.into_result()?;
        Ok((completion, operation.take_buffers().unwrap_or_default()))
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.backend_name)
            .field("model", &self.shared.config.model)
            .finish_non_exhaustive()
    }
}
