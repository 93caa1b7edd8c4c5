//! Timer/timeout utility implemented using `tokio::time::Sleep` on a spawned
//! task and connecting it with the caller through `tokio::sync::watch` and
//! `tokio::sync::Notify` channels. This is suitable only for coarse-grained
//! timeout intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::utils::RingStoreError;

use futures::future::FutureExt;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// Timer utility for signalling after a given timeout.
///
/// Supports restarting with a different duration. An optional explode action
/// runs on the sleeper task side when the deadline fires, which lets owners
/// multiplex many timers onto one channel. Must be used within the context
/// of a tokio runtime.
pub struct Timer {
    /// Deadline setting channel (caller side sender).
    deadline_tx: watch::Sender<Option<Instant>>,

    /// Timeout notification channel (caller side receiver).
    notify: Arc<Notify>,

    /// True if the current kickoff has fired and was not cancelled since.
    exploded: Arc<AtomicBool>,
}

impl Timer {
    /// Creates a new timer utility. If `explode_action` is given, it is
    /// called on the sleeper task whenever the deadline fires.
    pub fn new(
        explode_action: Option<Box<dyn Fn() + Send + 'static>>,
    ) -> Self {
        let (deadline_tx, mut deadline_rx) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let notify_ref = notify.clone();
        let exploded = Arc::new(AtomicBool::new(false));
        let exploded_ref = exploded.clone();

        // spawn the background sleeper task
        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);

            while deadline_rx.changed().await.is_ok() {
                // received a new deadline
                let deadline = *deadline_rx.borrow();
                if let Some(ddl) = deadline {
                    sleep.as_mut().reset(ddl);
                    (&mut sleep).await;

                    // only fire if deadline has not changed since last wakeup
                    if let Ok(false) = deadline_rx.has_changed() {
                        exploded_ref.store(true, Ordering::Release);
                        if let Some(action) = explode_action.as_ref() {
                            action();
                        }
                        notify_ref.notify_one();
                    }
                }
            }
            // sender has been dropped, terminate
        });

        Timer {
            deadline_tx,
            notify,
            exploded,
        }
    }

    /// Kicks off the timer with the given duration. Every call to `kickoff()`
    /// leads to one or zero notifications; if a new call to `kickoff()` is
    /// made before the active one fires, the timer restarts and will fire
    /// only at the new deadline.
    pub fn kickoff(&self, dur: Duration) -> Result<(), RingStoreError> {
        if dur.is_zero() {
            return Err(RingStoreError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.exploded.store(false, Ordering::Release);
        self.deadline_tx.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Cancels the currently scheduled timeout if one is kicked-off or
    /// already fired.
    pub fn cancel(&self) -> Result<(), RingStoreError> {
        self.deadline_tx.send(None)?;
        self.exploded.store(false, Ordering::Release);

        // consume all existing timeout notifications
        while self.notify.notified().now_or_never().is_some() {}

        Ok(())
    }

    /// True if the last kickoff has fired and was not cancelled since.
    pub fn exploded(&self) -> bool {
        self.exploded.load(Ordering::Acquire)
    }

    /// Waits for a timeout notification. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_timeout() -> Result<(), RingStoreError> {
        let timer = Arc::new(Timer::default());
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(100))?;
        tokio::select! {
            () = timer.timeout() => {
                let finish = Instant::now();
                assert!(finish.duration_since(start) >= Duration::from_millis(100));
                assert!(timer.exploded());
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), RingStoreError> {
        let timer = Arc::new(Timer::default());
        let timer_ref = timer.clone();
        let start = Instant::now();
        tokio::spawn(async move {
            // setter-side
            timer_ref.kickoff(Duration::from_millis(100))?;
            time::sleep(Duration::from_millis(50)).await;
            timer_ref.kickoff(Duration::from_millis(200))?;
            Ok::<(), RingStoreError>(())
        });
        // looper-side
        tokio::select! {
            () = timer.timeout() => {
                let finish = Instant::now();
                assert!(finish.duration_since(start) >= Duration::from_millis(250));
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), RingStoreError> {
        let timer = Arc::new(Timer::default());
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(50))?;
        time::sleep(Duration::from_millis(100)).await;
        timer.cancel()?;
        assert!(!timer.exploded());
        timer.kickoff(Duration::from_millis(200))?;
        tokio::select! {
            () = timer.timeout() => {
                let finish = Instant::now();
                assert!(finish.duration_since(start) >= Duration::from_millis(300));
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_explode_action() -> Result<(), RingStoreError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let timer = Timer::new(Some(Box::new(move || {
            tx.send(7).expect("explode action send should succeed");
        })));
        timer.kickoff(Duration::from_millis(50))?;
        assert_eq!(rx.recv().await, Some(7));
        Ok(())
    }
}
