//! Wall clock and one-shot timers.
//!
//! Timer callbacks do not survive a restart; callers that persist a
//! deadline are expected to re-arm it during replay.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Clock {
        Clock
    }

    /// Current wall-clock time, unix seconds.
    pub fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Run `f` once at unix time `at` (immediately if already past),
    /// unless `token` is cancelled first.
    pub fn after(
        &self,
        token: CancellationToken,
        at: u64,
        f: impl FnOnce() + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let delay = Duration::from_secs(at.saturating_sub(self.now()));
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => f(),
                _ = token.cancelled() => {}
            }
        })
    }
}
