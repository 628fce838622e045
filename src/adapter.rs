use std::{
    future::Future,
    io::Result,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use crate::{Awaitable, Error, Handle, Multiplexer, Operation, Outcome, Request};

/// Adapter to implement common IO traits on top of multiplexed operations
///
/// Every read or write submits an operation owning a copy of the data, so
/// the caller's buffer is never handed to the OS. Some thread has to keep
/// driving the multiplexer for the returned futures to make progress
pub struct IoStream {
    multiplexer: Multiplexer,
    handle: Arc<Handle>,
    position: u64,
    unread: Vec<u8>,
    reading: Option<Awaitable>,
    writing: Option<Awaitable>,
}

impl IoStream {
    /// Wrap a handle, registering it with the multiplexer
    ///
    /// # Errors
    ///
    /// If the handle is registered with another multiplexer
    pub fn new(multiplexer: &Multiplexer, handle: Arc<Handle>) -> std::result::Result<Self, Error> {
        multiplexer.register_handle(&handle)?;

        Ok(Self {
            multiplexer: multiplexer.clone(),
            handle,
            position: 0,
            unread: Vec::new(),
            reading: None,
            writing: None,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    /// Offset the next transfer starts at, ignored by unseekable handles
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Move the stream, dropping data read ahead of the old position
    pub fn set_position(&mut self, position: u64) {
        self.unread.clear();
        self.position = position;
    }

    /// Attempt to read into the buffer
    ///
    /// # Note
    ///
    /// A read submitted for a larger buffer than the next call brings keeps
    /// the excess around for later calls
    pub fn poll_read(
        self: Pin<&mut Self>,
        context: &mut Context,
        buffer: &mut [u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        if buffer.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !this.unread.is_empty() {
            return Poll::Ready(Ok(this.take_unread(buffer)));
        }

        let awaitable = this.reading.get_or_insert_with(|| {
            let operation = Operation::new(
                &this.handle,
                Request::read_exact(this.position, buffer.len()),
            );

            Awaitable::submit_on(operation, &this.multiplexer)
        });

        let outcome = ready!(Pin::new(awaitable).poll(context));
        let operation = this.reading.take().map(Awaitable::into_operation);

        let completion = outcome.and_then(Outcome::into_result)?;
        this.position += completion.transferred as u64;

        this.unread = operation
            .and_then(|operation| operation.take_buffers())
            .and_then(|buffers| buffers.into_iter().next())
            .unwrap_or_default();

        Poll::Ready(Ok(this.take_unread(buffer)))
    }

    fn take_unread(&mut self, buffer: &mut [u8]) -> usize {
        let amount = self.unread.len().min(buffer.len());
        buffer[..amount].copy_from_slice(&self.unread[..amount]);
        self.unread.drain(..amount);
        amount
    }

    /// Attempt to write the buffer's contents
    ///
    /// After [`Poll::Pending`] the call has to be repeated with the same
    /// data, as with any other writer
    pub fn poll_write(
        self: Pin<&mut Self>,
        context: &mut Context,
        buffer: &[u8],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();

        if buffer.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let awaitable = this.writing.get_or_insert_with(|| {
            let operation = Operation::new(
                &this.handle,
                Request::write(this.position, vec![buffer.to_vec()]),
            );

            Awaitable::submit_on(operation, &this.multiplexer)
        });

        let outcome = ready!(Pin::new(awaitable).poll(context));
        this.writing = None;

        let completion = outcome.and_then(Outcome::into_result)?;
        this.position += completion.transferred as u64;

        Poll::Ready(Ok(completion.transferred))
    }

    /// Wait for an outstanding write to land
    pub fn poll_shutdown(self: Pin<&mut Self>, context: &mut Context) -> Poll<Result<()>> {
        let this = self.get_mut();

        if let Some(awaitable) = &mut this.writing {
            let outcome = ready!(Pin::new(awaitable).poll(context));
            this.writing = None;
            outcome.and_then(Outcome::into_result)?;
        }

        Poll::Ready(Ok(()))
    }
}

impl Drop for IoStream {
    fn drop(&mut self) {
        for awaitable in [self.reading.take(), self.writing.take()].into_iter().flatten() {
            _ = awaitable.cancel();
        }
    }
}

#[cfg(feature = "tokio-io")]
mod tokio_io {
    use std::{
        io::Result,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use crate::adapter::IoStream;

    impl AsyncRead for IoStream {
        fn poll_read(
            self: Pin<&mut Self>,
            context: &mut Context,
            buffer: &mut ReadBuf,
        ) -> Poll<Result<()>> {
            self.poll_read(context, buffer.initialize_unfilled())
                .map(|result| result.map(|amount| buffer.advance(amount)))
        }
    }

    impl AsyncWrite for IoStream {
        fn poll_write(
            self: Pin<&mut Self>,
            context: &mut Context,
            buffer: &[u8],
        ) -> Poll<Result<usize>> {
            self.poll_write(context, buffer)
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, context: &mut Context) -> Poll<Result<()>> {
            self.poll_shutdown(context)
        }
    }
}

#[cfg(feature = "futures-io")]
mod futures_io {
    use std::{
        io::Result,
        pin::Pin,
        task::{Context, Poll},
    };

    use futures_io::{AsyncRead, AsyncWrite};

    use crate::adapter::IoStream;

    impl AsyncRead for IoStream {
        fn poll_read(
            self: Pin<&mut Self>,
            context: &mut Context,
            buffer: &mut [u8],
        ) -> Poll<Result<usize>> {
            self.poll_read(context, buffer)
        }
    }

    impl AsyncWrite for IoStream {
        fn poll_write(
            self: Pin<&mut Self>,
            context: &mut Context,
            buffer: &[u8],
        ) -> Poll<Result<usize>> {
            self.poll_write(context, buffer)
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, context: &mut Context) -> Poll<Result<()>> {
            self.poll_shutdown(context)
        }
    }
}
