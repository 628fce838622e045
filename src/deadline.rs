use std::time::{Duration, Instant, SystemTime};

/// A timeout for a blocking call, either relative to the moment the call
/// starts or pinned to a wall clock instant
///
/// A zero relative duration means "already expired" and is never confused
/// with [`Deadline::Infinite`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Deadline {
    /// Never expire
    #[default]
    Infinite,
    /// Expire once the duration has elapsed on the steady clock
    After(Duration),
    /// Expire once the system clock reaches the time point
    At(SystemTime),
}

impl Deadline {
    pub const NEVER: Self = Self::Infinite;

    /// Deadline that is expired before the call even begins
    pub const IMMEDIATE: Self = Self::After(Duration::ZERO);

    pub const fn after(duration: Duration) -> Self {
        Self::After(duration)
    }

    pub const fn at(time: SystemTime) -> Self {
        Self::At(time)
    }

    #[must_use]
    pub const fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Whether a call starting right now would time out without blocking
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.start().is_expired()
    }

    /// Pin the deadline at the start of a blocking call
    #[must_use]
    pub fn start(self) -> Expiry {
        match self {
            Self::Infinite => Expiry::Never,
            Self::After(duration) => Instant::now()
                .checked_add(duration)
                .map_or(Expiry::Never, Expiry::Steady),
            Self::At(time) => Expiry::Wall(time),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<SystemTime> for Deadline {
    fn from(time: SystemTime) -> Self {
        Self::At(time)
    }
}

/// A [`Deadline`] resolved against the clock at the start of a call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Never,
    Steady(Instant),
    Wall(SystemTime),
}

impl Expiry {
    /// Time left before expiry, [`None`] meaning forever
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Steady(instant) => Some(instant.saturating_duration_since(Instant::now())),
            Self::Wall(time) => Some(
                time.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Steady clock instant at which this expires, re-evaluated for wall
    /// clock deadlines on every call
    pub(crate) fn instant(&self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::Steady(instant) => Some(*instant),
            Self::Wall(_) => self
                .remaining()
                .map(|left| Instant::now().checked_add(left).unwrap_or_else(Instant::now)),
        }
    }
}
