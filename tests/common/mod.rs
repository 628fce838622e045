#![allow(dead_code)]
//! Shared integration test utilities.

use std::{
    io::Write,
    sync::{Arc, Once},
    time::Duration,
};

use io_multiplexer::{BackendKind, Config, Deadline, Error, Handle, Multiplexer};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Install a test writer subscriber honoring `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// One multiplexer per backend this machine can open.
///
/// `poll` is always available, `io_uring` only where the kernel and any
/// sandbox allow it.
pub fn multiplexers(config: Config) -> Vec<Multiplexer> {
    init_test_logging();

    let mut multiplexers =
        vec![Multiplexer::new(config.backend(BackendKind::Poll)).expect("poll backend")];

    if let Ok(multiplexer) = Multiplexer::new(config.backend(BackendKind::IoUring)) {
        multiplexers.push(multiplexer);
    }

    multiplexers
}

/// Scratch file holding `contents`, registered with the multiplexer.
pub fn file_with(multiplexer: &Multiplexer, contents: &[u8]) -> Arc<Handle> {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(contents).unwrap();

    let handle = Arc::new(Handle::from_file(file).unwrap());
    multiplexer.register_handle(&handle).unwrap();
    handle
}

/// Pipe with both ends registered with the multiplexer.
pub fn pipe(multiplexer: &Multiplexer) -> (Arc<Handle>, Arc<Handle>) {
    let (reader, writer) = Handle::pipe().unwrap();
    let (reader, writer) = (Arc::new(reader), Arc::new(writer));

    multiplexer.register_handle(&reader).unwrap();
    multiplexer.register_handle(&writer).unwrap();
    (reader, writer)
}

/// Drive until nothing is in flight, failing the test after a generous
/// timeout.
pub fn drain(multiplexer: &Multiplexer) -> usize {
    multiplexer
        .run_until(Deadline::after(Duration::from_secs(10)))
        .expect("multiplexer drains")
}

/// Run one pass, treating expiry as an empty pass.
pub fn tick(multiplexer: &Multiplexer, timeout: Duration) -> Result<(), Error> {
    match multiplexer.run_once(Deadline::after(timeout)) {
        Ok(_) | Err(Error::TimedOut) => Ok(()),
        Err(error) => Err(error),
    }
}
