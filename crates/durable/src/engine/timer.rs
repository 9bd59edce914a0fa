//! Durable timers backed by tokio sleeps
//!
//! The durable part of a timer is its `timer_started` event, which carries the
//! absolute fire time. This service only holds the in-process sleep that
//! notifies the owning execution; after a restart the engine re-arms every
//! pending timer with whatever is left of its delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Arms and cancels in-process timer sleeps
#[derive(Debug, Default)]
pub struct TimerService {
    armed: DashMap<(Uuid, String), CancellationToken>,
}

impl TimerService {
    /// Create an empty timer service
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that calls `on_fire` once `fire_at` is reached
    ///
    /// A fire time in the past fires immediately. Re-arming an already armed
    /// timer replaces the previous sleep.
    pub fn arm<F>(&self, workflow_id: Uuid, timer_id: &str, fire_at: DateTime<Utc>, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = remaining(fire_at, Utc::now());
        let token = CancellationToken::new();
        if let Some(previous) = self
            .armed
            .insert((workflow_id, timer_id.to_string()), token.clone())
        {
            previous.cancel();
        }

        debug!(%workflow_id, %timer_id, ?delay, "armed timer");
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => on_fire(),
                _ = token.cancelled() => {}
            }
        });
    }

    /// Cancel one timer; returns whether it was armed
    pub fn cancel(&self, workflow_id: Uuid, timer_id: &str) -> bool {
        match self.armed.remove(&(workflow_id, timer_id.to_string())) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a timer that has fired
    pub fn disarm(&self, workflow_id: Uuid, timer_id: &str) {
        self.armed.remove(&(workflow_id, timer_id.to_string()));
    }

    /// Cancel every timer of one execution
    pub fn cancel_all(&self, workflow_id: Uuid) {
        self.armed.retain(|(id, _), token| {
            if *id == workflow_id {
                token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Number of armed timers across all executions
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

/// Delay left until `fire_at`, clamped at zero
pub fn remaining(fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (fire_at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_remaining_is_clamped() {
        let now = Utc::now();
        assert_eq!(remaining(now - chrono::Duration::seconds(5), now), Duration::ZERO);
        assert_eq!(
            remaining(now + chrono::Duration::seconds(5), now),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_past_fire_time_fires_immediately() {
        let timers = TimerService::new();
        let (tx, rx) = oneshot::channel();

        timers.arm(Uuid::now_v7(), "t", Utc::now() - chrono::Duration::hours(1), move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timer should fire")
            .expect("sender kept");
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let timers = TimerService::new();
        let workflow_id = Uuid::now_v7();
        let (tx, mut rx) = oneshot::channel::<()>();

        timers.arm(workflow_id, "deadline", Utc::now() + chrono::Duration::milliseconds(50), move || {
            let _ = tx.send(());
        });
        assert!(timers.cancel(workflow_id, "deadline"));
        assert!(!timers.cancel(workflow_id, "deadline"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // the callback (and its sender) was dropped without firing
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[tokio::test]
    async fn test_cancel_all_only_touches_one_execution() {
        let timers = TimerService::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let later = Utc::now() + chrono::Duration::hours(1);

        timers.arm(first, "a", later, || {});
        timers.arm(first, "b", later, || {});
        timers.arm(second, "a", later, || {});

        timers.cancel_all(first);

        assert_eq!(timers.armed_count(), 1);
        assert!(timers.cancel(second, "a"));
    }
}
