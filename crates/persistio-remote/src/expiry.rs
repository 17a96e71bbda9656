//! Freshness bookkeeping for remote values

use derive_more::Display;
use std::time::Duration;

/// When the cached value was last known good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stamp {
    /// Loaded or confirmed at this many ms since the epoch
    #[display("at {_0}")]
    At(i64),
    /// Must reload before the value is served again
    #[display("force-expired")]
    ForceExpired,
    /// Treated as past its freshness window
    #[display("weak-expired")]
    WeakExpired,
}

/// How a proxy treats a value past its freshness window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Reload on the caller's thread once the window has passed
    Blocking(Duration),
    /// The value never goes stale on its own
    Never,
    /// Serve the cached value and reload in the background
    Background(Duration),
}

/// What `value()` has to do before answering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Reload before answering
    Reload,
    /// Answer now and reload in the background
    Refresh,
}

impl ExpiryPolicy {
    /// Negative windows block, zero never expires, positive reload in the background
    #[must_use]
    pub const fn from_millis(expiry_ms: i64) -> Self {
        match expiry_ms {
            0 => Self::Never,
            ms if ms < 0 => Self::Blocking(Duration::from_millis(ms.unsigned_abs())),
            ms => Self::Background(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Decide based on the stamp and the current time in ms
    #[must_use]
    pub fn freshness(&self, stamp: Stamp, now: i64) -> Freshness {
        let elapsed = match stamp {
            Stamp::ForceExpired => return Freshness::Reload,
            Stamp::WeakExpired => true,
            Stamp::At(at) => match self {
                Self::Never => false,
                Self::Blocking(window) | Self::Background(window) => {
                    let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
                    now.saturating_sub(at) >= window
                }
            },
        };
        if !elapsed {
            return Freshness::Fresh;
        }
        match self {
            Self::Blocking(_) => Freshness::Reload,
            Self::Never | Self::Background(_) => Freshness::Refresh,
        }
    }
}
