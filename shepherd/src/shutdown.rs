//! Cooperative stop signalling for the two long-lived processes.
//!
//! The daemon's tick loop and the wrapper's heartbeat task share one shape:
//! several tasks watch a single flag, the first stop request wins, and the
//! exit path wants to know what kind of request it was. A SIGTERM from the
//! service manager reads differently in the log than an operator's Ctrl-C,
//! and the wrapper stops its heartbeat simply because the workload exited.
//! [`StopSignal`] carries that cause alongside the flag.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Why a stop was requested. The first cause to arrive sticks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopCause {
    /// Operator interrupt (SIGINT / Ctrl-C).
    Interrupt,
    /// Service-manager termination (SIGTERM).
    Terminate,
    /// Programmatic stop: the owner is done with the watched work.
    Finished,
}

const LIVE: u8 = 0;

fn encode(cause: StopCause) -> u8 {
    match cause {
        StopCause::Interrupt => 1,
        StopCause::Terminate => 2,
        StopCause::Finished => 3,
    }
}

fn decode(raw: u8) -> Option<StopCause> {
    match raw {
        1 => Some(StopCause::Interrupt),
        2 => Some(StopCause::Terminate),
        3 => Some(StopCause::Finished),
        _ => None,
    }
}

/// Shared stop flag with a recorded cause.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<StopSignalInner>,
}

#[derive(Debug, Default)]
struct StopSignalInner {
    state: AtomicU8,
    notify: Notify,
}

impl StopSignal {
    /// Create a live (not yet stopped) signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Only the first cause is recorded; later requests
    /// still wake waiters but do not overwrite it.
    pub fn request(&self, cause: StopCause) {
        let _ = self.inner.state.compare_exchange(
            LIVE,
            encode(cause),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.inner.notify.notify_waiters();
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != LIVE
    }

    /// The recorded cause, once stopped.
    pub fn cause(&self) -> Option<StopCause> {
        decode(self.inner.state.load(Ordering::SeqCst))
    }

    /// Wait until a stop is requested.
    pub async fn stopped(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register with the notifier before the final flag check so a
        // request landing in between cannot be missed.
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_first_cause_sticks() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert_eq!(stop.cause(), None);

        stop.request(StopCause::Terminate);
        stop.request(StopCause::Interrupt);
        assert!(stop.is_stopped());
        assert_eq!(stop.cause(), Some(StopCause::Terminate));
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_after_request() {
        let stop = StopSignal::new();
        stop.request(StopCause::Finished);
        timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_wakes_all_clones() {
        let stop = StopSignal::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let waiter = stop.clone();
                tokio::spawn(async move { waiter.stopped().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.request(StopCause::Interrupt);
        for handle in handles {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("waiter did not observe the stop")
                .unwrap();
        }
        assert_eq!(stop.cause(), Some(StopCause::Interrupt));
    }

    #[tokio::test]
    async fn test_request_just_before_wait_is_not_missed() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        stop.request(StopCause::Finished);
        // The waiter subscribes only now; the earlier request must still
        // resolve the wait.
        timeout(Duration::from_secs(1), waiter.stopped())
            .await
            .unwrap();
    }
}
