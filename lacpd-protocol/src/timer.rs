//! Protocol timers
//!
//! All protocol timers are cancellable one-shots. Expiry never runs a
//! transition inline: the timer task posts an event onto the owning
//! machine's queue and exits. Restarting replaces any pending firing.

use crate::event::MachineEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fast periodic transmission interval (802.1AX 6.4.4)
pub const FAST_PERIODIC_TIME: Duration = Duration::from_secs(1);
/// Slow periodic transmission interval
pub const SLOW_PERIODIC_TIME: Duration = Duration::from_secs(30);
/// Short current-while timeout: 3 x fast periodic
pub const SHORT_TIMEOUT_TIME: Duration = Duration::from_secs(3);
/// Long current-while timeout: 3 x slow periodic
pub const LONG_TIMEOUT_TIME: Duration = Duration::from_secs(90);
/// Churn detection bound
pub const CHURN_DETECTION_TIME: Duration = Duration::from_secs(60);
/// Mux aggregate-wait delay
pub const AGGREGATE_WAIT_TIME: Duration = Duration::from_secs(2);
/// Transmission cap per fast periodic interval (802.1AX 6.4.16)
pub const MAX_TX_PER_INTERVAL: u32 = 3;

/// Cancellable one-shot that posts `event` to a machine queue on expiry
pub(crate) struct EventTimer<E: Clone + Send + 'static> {
    queue: mpsc::Sender<MachineEvent<E>>,
    src: &'static str,
    event: E,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl<E: Clone + Send + 'static> EventTimer<E> {
    pub fn new(
        queue: mpsc::Sender<MachineEvent<E>>,
        src: &'static str,
        event: E,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            src,
            event,
            timeout,
            handle: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// (Re)arm the timer, replacing any pending firing
    pub fn start(&mut self) {
        self.stop();
        let queue = self.queue.clone();
        let src = self.src;
        let event = self.event.clone();
        let timeout = self.timeout;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = queue.send(MachineEvent::new(src, event)).await;
        }));
    }

    /// Cancel any pending firing
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<E: Clone + Send + 'static> Drop for EventTimer<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Fired,
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_at_timeout() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = EventTimer::new(tx, "test", TestEvent::Fired, Duration::from_secs(3));
        timer.start();

        advance(Duration::from_millis(2900)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(200)).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, TestEvent::Fired);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stop_cancels() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = EventTimer::new(tx, "test", TestEvent::Fired, Duration::from_secs(1));
        timer.start();
        timer.stop();

        advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restart_replaces_pending() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = EventTimer::new(tx, "test", TestEvent::Fired, Duration::from_secs(2));
        timer.start();
        advance(Duration::from_secs(1)).await;
        timer.start();

        advance(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err());
        advance(Duration::from_millis(600)).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
