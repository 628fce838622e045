//! Multiplexer construction settings
//!
//! Values resolve in this order, highest priority first:
//!
//! 1. builder methods on [`Config`]
//! 2. environment variables read by [`Config::from_env`]
//! 3. [`Config::default`]
//!
//! | Variable | Values |
//! |----------|--------|
//! | `IO_MULTIPLEXER_BACKEND` | `auto`, `io_uring`, `poll` |
//! | `IO_MULTIPLEXER_MODEL` | `parallel`, `cooperative` |
//! | `IO_MULTIPLEXER_RING_ENTRIES` | `u32` |

use crate::Error;

pub const ENV_BACKEND: &str = "IO_MULTIPLEXER_BACKEND";
pub const ENV_MODEL: &str = "IO_MULTIPLEXER_MODEL";
pub const ENV_RING_ENTRIES: &str = "IO_MULTIPLEXER_RING_ENTRIES";

const DEFAULT_RING_ENTRIES: u32 = 256;

/// How threads are allowed to drive a multiplexer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingModel {
    /// Any number of threads may call `run_once` concurrently, every ready
    /// operation is claimed by exactly one of them
    #[default]
    Parallel,
    /// A single thread drives the multiplexer and resumes cooperative tasks
    /// inline, the first thread to drive becomes that thread
    Cooperative,
}

/// Which OS mechanism carries the operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// `io_uring` where the kernel allows it, `poll(2)` otherwise
    #[default]
    Auto,
    /// Linux `io_uring` completion queue
    IoUring,
    /// `poll(2)` readiness with the transfers performed inline
    Poll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct Config {
    pub model: SchedulingModel,
    pub backend: BackendKind,
    /// Submission queue size when the `io_uring` backend is used
    pub ring_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: SchedulingModel::default(),
            backend: BackendKind::default(),
            ring_entries: DEFAULT_RING_ENTRIES,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    ///
    /// # Errors
    ///
    /// If a variable is set to a value that can't be parsed
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// If a variable is set to a value that can't be parsed
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend = match value.trim() {
                "auto" => BackendKind::Auto,
                "io_uring" | "io-uring" | "uring" => BackendKind::IoUring,
                "poll" => BackendKind::Poll,
                _ => return Err(invalid(ENV_BACKEND, value)),
            };
        }

        if let Some(value) = lookup(ENV_MODEL) {
            self.model = match value.trim() {
                "parallel" => SchedulingModel::Parallel,
                "cooperative" => SchedulingModel::Cooperative,
                _ => return Err(invalid(ENV_MODEL, value)),
            };
        }

        if let Some(value) = lookup(ENV_RING_ENTRIES) {
            self.ring_entries = match value.trim().parse() {
                Ok(entries) if entries > 0 => entries,
                _ => return Err(invalid(ENV_RING_ENTRIES, value)),
            };
        }

        Ok(())
    }

    pub const fn parallel(mut self) -> Self {
        self.model = SchedulingModel::Parallel;
        self
    }

    pub const fn cooperative(mut self) -> Self {
        self.model = SchedulingModel::Cooperative;
        self
    }

    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub const fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }
}

fn invalid(variable: &'static str, value: String) -> Error {
    Error::Config { variable, value }
}
