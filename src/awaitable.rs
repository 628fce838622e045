use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{Cancellation, Error, Multiplexer, Operation, Outcome, Phase};

/// Future resolving once an operation reaches a terminal phase
///
/// Polling never drives the multiplexer, some thread has to keep calling
/// [`Multiplexer::run_once`]. The task waker is stored on the operation and
/// woken by whichever thread resolves it, exactly once
#[must_use = "futures do nothing unless polled"]
pub struct Awaitable {
    operation: Operation,
    submit_on: Option<Multiplexer>,
    resumed: bool,
}

impl Awaitable {
    /// Await an operation which has been or will be submitted elsewhere
    pub const fn new(operation: Operation) -> Self {
        Self {
            operation,
            submit_on: None,
            resumed: false,
        }
    }

    /// Await an operation, submitting it on the first poll
    pub fn submit_on(operation: Operation, multiplexer: &Multiplexer) -> Self {
        Self {
            operation,
            submit_on: Some(multiplexer.clone()),
            resumed: false,
        }
    }

    /// Whether awaiting would complete without suspending
    #[must_use]
    pub fn await_ready(&self) -> bool {
        self.operation.is_terminal()
    }

    /// Cancel the underlying operation, the future still resolves exactly
    /// once with whichever result won
    ///
    /// # Errors
    ///
    /// As for [`Operation::cancel`]
    pub fn cancel(&self) -> Result<Cancellation, Error> {
        self.operation.cancel()
    }

    #[must_use]
    pub const fn operation(&self) -> &Operation {
        &self.operation
    }

    #[must_use]
    pub fn into_operation(self) -> Operation {
        self.operation
    }
}

impl From<Operation> for Awaitable {
    fn from(operation: Operation) -> Self {
        Self::new(operation)
    }
}

impl Future for Awaitable {
    type Output = Result<Outcome, Error>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.resumed, "awaitable polled after completion");

        if let Some(multiplexer) = this.submit_on.take() {
            if this.operation.poll() == Phase::Unsubmitted {
                if let Err(error) = multiplexer.submit(&this.operation) {
                    this.resumed = true;
                    return Poll::Ready(Err(error));
                }
            }
        }

        if this.operation.poll() == Phase::Unsubmitted {
            this.resumed = true;
            return Poll::Ready(Err(Error::InvalidArgument(
                "operation was never submitted",
            )));
        }

        match this.operation.state.poll_outcome(context.waker()) {
            Some(outcome) => {
                this.resumed = true;
                Poll::Ready(Ok(outcome))
            }
            None => Poll::Pending,
        }
    }
}
