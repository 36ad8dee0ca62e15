//! # Flow Control
//!
//! [`FlowController`] bounds how many stream messages a sender may have in
//! flight ahead of confirmed delivery. Every message first takes a slot with
//! [`FlowController::wait_for_slot`]; the transport calls
//! [`FlowController::notify_completed`] once the message has been written.
//!
//! Slot `n` (zero based, in arrival order) is granted as soon as
//! `completed + cache_depth > n`, so memory held by unacknowledged chunks stays
//! at `cache_depth` messages no matter how large the transfer is.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

/// Default number of messages allowed ahead of confirmed completion.
pub const DEFAULT_CACHE_DEPTH: u64 = 8;

/// The controller was closed while a caller waited for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow controller closed")]
pub struct FlowClosed;

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    initiated: u64,
    closed: bool,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

#[derive(Debug)]
pub struct FlowController {
    cache_depth: u64,
    counters: Mutex<Counters>,
    progress: Notify,
}

impl FlowController {
    pub fn new(cache_depth: u64) -> Self {
        Self {
            cache_depth: cache_depth.max(1),
            counters: Mutex::new(Counters::default()),
            progress: Notify::new(),
        }
    }

    pub fn cache_depth(&self) -> u64 {
        self.cache_depth
    }

    /// Take the next index and wait until it fits inside the window.
    pub async fn wait_for_slot(&self) -> Result<(), FlowClosed> {
        let receiver = {
            let mut counters = self.counters.lock();
            if counters.closed {
                return Err(FlowClosed);
            }

            let index = counters.initiated;
            counters.initiated += 1;
            if counters.completed + self.cache_depth > index {
                return Ok(());
            }

            debug!(
                "Slot {} waiting (completed {}, depth {})",
                index, counters.completed, self.cache_depth
            );
            let (tx, rx) = oneshot::channel();
            counters.waiters.push_back((index, tx));
            rx
        };

        // The sender is dropped without a send only on close.
        receiver.await.map_err(|_| FlowClosed)
    }

    /// Record one delivered message and release every waiter that now fits, oldest first.
    pub fn notify_completed(&self) {
        {
            let mut counters = self.counters.lock();
            counters.completed += 1;

            while let Some((index, _)) = counters.waiters.front() {
                if counters.completed + self.cache_depth <= *index {
                    break;
                }
                if let Some((_, waiter)) = counters.waiters.pop_front() {
                    let _ = waiter.send(());
                }
            }
        }

        self.progress.notify_waiters();
    }

    /// Fail every pending and future `wait_for_slot` call.
    pub fn close(&self) {
        {
            let mut counters = self.counters.lock();
            counters.closed = true;
            counters.waiters.clear();
        }
        self.progress.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.counters.lock().closed
    }

    pub fn completed(&self) -> u64 {
        self.counters.lock().completed
    }

    pub fn initiated(&self) -> u64 {
        self.counters.lock().initiated
    }

    pub fn in_flight(&self) -> u64 {
        let counters = self.counters.lock();
        counters.initiated - counters.completed.min(counters.initiated)
    }

    fn is_idle(&self) -> bool {
        let counters = self.counters.lock();
        counters.closed || counters.completed >= counters.initiated
    }

    /// Wait until every initiated message has been confirmed, or the controller is closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_slots_within_depth_pass_immediately() {
        let flow = FlowController::new(2);

        flow.wait_for_slot().await.unwrap();
        flow.wait_for_slot().await.unwrap();

        assert_eq!(flow.initiated(), 2);
        assert_eq!(flow.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_fourth_slot_needs_two_completions() {
        let flow = Arc::new(FlowController::new(2));
        flow.wait_for_slot().await.unwrap();
        flow.wait_for_slot().await.unwrap();

        let third = tokio::spawn({
            let flow = flow.clone();
            async move { flow.wait_for_slot().await }
        });
        tokio::time::sleep(SHORT).await;
        let fourth = tokio::spawn({
            let flow = flow.clone();
            async move { flow.wait_for_slot().await }
        });
        tokio::time::sleep(SHORT).await;
        assert!(!third.is_finished());
        assert!(!fourth.is_finished());

        flow.notify_completed();
        timeout(Duration::from_secs(1), third).await.unwrap().unwrap().unwrap();
        tokio::time::sleep(SHORT).await;
        assert!(!fourth.is_finished());

        flow.notify_completed();
        timeout(Duration::from_secs(1), fourth).await.unwrap().unwrap().unwrap();
        assert_eq!(flow.completed(), 2);
    }

    #[tokio::test]
    async fn test_waiters_released_in_arrival_order() {
        let flow = Arc::new(FlowController::new(1));
        flow.wait_for_slot().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for n in 0..3 {
            let flow = flow.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                flow.wait_for_slot().await.unwrap();
                order_tx.send(n).unwrap();
            });
            tokio::time::sleep(SHORT).await;
        }

        for expected in 0..3 {
            flow.notify_completed();
            let got = timeout(Duration::from_secs(1), order_rx.recv()).await.unwrap();
            assert_eq!(got, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let flow = Arc::new(FlowController::new(1));
        flow.wait_for_slot().await.unwrap();

        let waiter = tokio::spawn({
            let flow = flow.clone();
            async move { flow.wait_for_slot().await }
        });
        tokio::time::sleep(SHORT).await;
        flow.close();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(FlowClosed));
        assert_eq!(flow.wait_for_slot().await, Err(FlowClosed));
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let flow = Arc::new(FlowController::new(4));
        flow.wait_for_slot().await.unwrap();
        flow.wait_for_slot().await.unwrap();

        let idle = tokio::spawn({
            let flow = flow.clone();
            async move { flow.wait_idle().await }
        });
        tokio::time::sleep(SHORT).await;
        assert!(!idle.is_finished());

        flow.notify_completed();
        flow.notify_completed();
        timeout(Duration::from_secs(1), idle).await.unwrap().unwrap();
        assert_eq!(flow.in_flight(), 0);
    }
}
