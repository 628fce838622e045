use std::{
    collections::VecDeque,
    future::{Future, IntoFuture},
    marker::PhantomData,
    sync::Arc,
    task::{Context, Poll},
};

use async_task::{Runnable, Task};
use parking_lot::Mutex;

/// Simple poll loop for driving a future to completion concurrently with a
/// ticker function to act as an event loop
///
/// A cooperative caller passes a ticker running the executor and one
/// multiplexer pass, so the future is re-polled after every batch
///
/// # Errors
///
/// Whatever the ticker fails with
pub fn block_on<F, T, E>(future: F, mut ticker: T) -> Result<F::Output, E>
where
    F: IntoFuture,
    T: FnMut() -> Result<(), E>,
{
    let waker = noop_waker::noop_waker();
    let mut context = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future.into_future());

    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
            return Ok(output);
        }

        ticker()?;
    }
}

/// Single threaded FIFO executor for tasks awaiting operations
///
/// Tasks only ever run inside [`Executor::tick`] on the thread that owns the
/// executor, but they may be woken from any thread resolving their
/// operation. The executor itself never leaves its thread:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<io_multiplexer::Executor>();
/// ```
///
/// Dropping the executor cancels the tasks waiting in its queue. A detached
/// task woken after that is never polled again
#[derive(Default)]
pub struct Executor {
    tasks: Arc<Mutex<VecDeque<Runnable>>>,
    _local: PhantomData<*const ()>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task to be executed in the background
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: IntoFuture,
        F::IntoFuture: 'static,
        F::Output: 'static,
    {
        let tasks = Arc::clone(&self.tasks);
        let (runnable, task) = async_task::spawn_local(future.into_future(), move |runnable| {
            tasks.lock().push_back(runnable);
        });

        runnable.schedule();
        task
    }

    /// Number of tasks waiting to be polled
    pub fn scheduled(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Poll all currently scheduled tasks, returning how many ran
    pub fn tick(&self) -> usize {
        let mut ran = 0;

        loop {
            let item = self.tasks.lock().pop_front();
            match item {
                Some(runnable) => {
                    runnable.run();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // cancelled here on the owning thread, the lock is released before
        // any future is dropped
        let queued = std::mem::take(&mut *self.tasks.lock());
        drop(queued);
    }
}
