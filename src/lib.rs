//! Byte i/o multiplexer driving cancellable per-operation state machines
//!
//! Register an opened [`Handle`] with a [`Multiplexer`], submit [`Operation`]s
//! against it and drive them with [`Multiplexer::run_once`] or by waiting on
//! them. Every operation carries its own terminal [`Outcome`], a failing
//! transfer never affects its siblings.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use io_multiplexer::{Config, Deadline, Handle, Multiplexer, Operation, Request};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let multiplexer = Multiplexer::new(Config::from_env()?)?;
//! let handle = Arc::new(Handle::from_file(std::fs::File::open("/etc/hostname")?)?);
//! multiplexer.register_handle(&handle)?;
//!
//! let operation = Operation::new(&handle, Request::read_exact(0, 64));
//! operation.submit(&multiplexer)?;
//!
//! let completion = operation.wait(Deadline::NEVER)?.into_result()?;
//! println!("read {} bytes", completion.transferred);
//! # Ok(())
//! # }
//! ```
//!
//! Cooperative callers wrap operations in an [`Awaitable`] and run them on
//! an [`Executor`] whose ticker also drives the multiplexer.

mod adapter;
mod awaitable;
mod backend;
mod buffer;
pub mod config;
mod deadline;
mod error;
mod executor;
mod handle;
mod multiplexer;
mod notify;
mod operation;

pub use crate::{
    adapter::IoStream,
    awaitable::Awaitable,
    buffer::RegisteredBuffer,
    config::{BackendKind, Config, SchedulingModel},
    deadline::{Deadline, Expiry},
    error::Error,
    executor::{block_on, Executor},
    handle::{Capabilities, Handle},
    multiplexer::Multiplexer,
    operation::{
        BarrierKind, CancelStatus, Cancellation, Completion, Operation, OperationKind, Outcome,
        Phase, Request,
    },
};
