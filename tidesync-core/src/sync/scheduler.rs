//! Sync scheduling: eligibility, cadence, and failure backoff.
//!
//! Decides when the cycle runs, never what it does. The run loop is the
//! single consumer of sync requests and awaits the cycle inline, so at
//! most one cycle is in flight per device; triggers arriving mid-cycle
//! coalesce in the capacity-1 request channel.

use crate::sync::settings::SyncSettings;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a sync cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// The periodic interval elapsed.
    Periodic,
    /// Explicit user action; bypasses the interval, still checks
    /// constraints.
    Manual,
    /// A local edit burst settled.
    ChangeTriggered,
}

/// Network classification for eligibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Unmetered,
    Metered,
    Offline,
}

/// Snapshot of device conditions, supplied by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemConditions {
    pub network: NetworkKind,
    pub charging: bool,
    pub battery_low: bool,
}

/// Timing and constraint policy. All configuration, nothing hard-coded.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub wifi_only: bool,
    pub requires_charging: bool,
    pub battery_not_low: bool,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            backoff_base: Duration::from_secs(15 * 60),
            backoff_cap: Duration::from_secs(8 * 60 * 60),
            wifi_only: true,
            requires_charging: false,
            battery_not_low: true,
        }
    }
}

impl SchedulePolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.sync_frequency_minutes * 60),
            wifi_only: settings.wifi_only,
            requires_charging: settings.requires_charging,
            battery_not_low: settings.battery_not_low,
            ..Self::default()
        }
    }
}

/// Decides eligibility and cadence for sync cycles.
pub struct SyncScheduler {
    policy: SchedulePolicy,
    consecutive_failures: u32,
}

impl SyncScheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    /// Constraint check only; cadence is handled by [`next_delay`].
    ///
    /// [`next_delay`]: Self::next_delay
    pub fn is_eligible(&self, conditions: &SystemConditions) -> bool {
        if conditions.network == NetworkKind::Offline {
            return false;
        }
        if self.policy.wifi_only && conditions.network != NetworkKind::Unmetered {
            return false;
        }
        if self.policy.requires_charging && !conditions.charging {
            return false;
        }
        if self.policy.battery_not_low && conditions.battery_low {
            return false;
        }
        true
    }

    /// Time until the next periodic attempt: the configured interval, or
    /// the current backoff after failures.
    pub fn next_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.policy.interval;
        }
        let exponent = self.consecutive_failures.saturating_sub(1).min(10);
        let backoff = self
            .policy
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exponent));
        backoff.min(self.policy.backoff_cap)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Drive the schedule until the request channel closes.
    ///
    /// `conditions` samples device state at each attempt; `cycle` runs one
    /// full sync and reports success. The cycle is awaited inline, which
    /// is what enforces single-flight.
    pub async fn run<C, F, Fut>(
        mut self,
        mut requests: mpsc::Receiver<SyncRequest>,
        conditions: C,
        mut cycle: F,
    ) where
        C: Fn() -> SystemConditions,
        F: FnMut(SyncRequest) -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            let request = tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => SyncRequest::Periodic,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };

            if !self.is_eligible(&conditions()) {
                debug!(?request, "sync skipped: constraints not met");
                continue;
            }

            info!(?request, "starting sync cycle");
            if cycle(request).await {
                self.record_success();
            } else {
                self.record_failure();
                warn!(
                    failures = self.consecutive_failures,
                    retry_in_secs = self.next_delay().as_secs(),
                    "sync cycle failed, backing off"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn good_conditions() -> SystemConditions {
        SystemConditions {
            network: NetworkKind::Unmetered,
            charging: true,
            battery_low: false,
        }
    }

    #[test]
    fn eligibility_constraints() {
        let scheduler = SyncScheduler::new(SchedulePolicy::default());

        assert!(scheduler.is_eligible(&good_conditions()));

        assert!(!scheduler.is_eligible(&SystemConditions {
            network: NetworkKind::Offline,
            ..good_conditions()
        }));

        // wifi_only rejects metered
        assert!(!scheduler.is_eligible(&SystemConditions {
            network: NetworkKind::Metered,
            ..good_conditions()
        }));

        // battery_not_low rejects low battery
        assert!(!scheduler.is_eligible(&SystemConditions {
            battery_low: true,
            ..good_conditions()
        }));
    }

    #[test]
    fn metered_allowed_when_not_wifi_only() {
        let scheduler = SyncScheduler::new(SchedulePolicy {
            wifi_only: false,
            ..SchedulePolicy::default()
        });
        assert!(scheduler.is_eligible(&SystemConditions {
            network: NetworkKind::Metered,
            ..good_conditions()
        }));
    }

    #[test]
    fn charging_requirement() {
        let scheduler = SyncScheduler::new(SchedulePolicy {
            requires_charging: true,
            ..SchedulePolicy::default()
        });
        assert!(!scheduler.is_eligible(&SystemConditions {
            charging: false,
            ..good_conditions()
        }));
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut scheduler = SyncScheduler::new(SchedulePolicy::default());
        let interval = Duration::from_secs(3600);
        let base = Duration::from_secs(900);

        assert_eq!(scheduler.next_delay(), interval);

        scheduler.record_failure();
        assert_eq!(scheduler.next_delay(), base);

        scheduler.record_failure();
        assert_eq!(scheduler.next_delay(), base * 2);

        scheduler.record_failure();
        assert_eq!(scheduler.next_delay(), base * 4);

        for _ in 0..10 {
            scheduler.record_failure();
        }
        assert_eq!(scheduler.next_delay(), Duration::from_secs(8 * 60 * 60));

        scheduler.record_success();
        assert_eq!(scheduler.next_delay(), interval);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_runs_immediately() {
        let (tx, rx) = mpsc::channel(1);
        let count = Arc::new(AtomicU32::new(0));
        let cycle_count = count.clone();

        let scheduler = SyncScheduler::new(SchedulePolicy::default());
        let handle = tokio::spawn(scheduler.run(rx, good_conditions, move |_| {
            let count = cycle_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                true
            }
        }));

        tx.send(SyncRequest::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_after_interval() {
        let (tx, rx) = mpsc::channel::<SyncRequest>(1);
        let count = Arc::new(AtomicU32::new(0));
        let cycle_count = count.clone();

        let scheduler = SyncScheduler::new(SchedulePolicy {
            interval: Duration::from_secs(60),
            ..SchedulePolicy::default()
        });
        let handle = tokio::spawn(scheduler.run(rx, good_conditions, move |_| {
            let count = cycle_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                true
            }
        }));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_shortens_the_next_attempt() {
        let (tx, rx) = mpsc::channel::<SyncRequest>(1);
        let count = Arc::new(AtomicU32::new(0));
        let cycle_count = count.clone();

        let scheduler = SyncScheduler::new(SchedulePolicy {
            interval: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(900),
            ..SchedulePolicy::default()
        });
        let handle = tokio::spawn(scheduler.run(rx, good_conditions, move |_| {
            let count = cycle_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                false // always fail
            }
        }));

        // First attempt at the full interval
        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // After a failure the retry comes at the backoff base, not the
        // interval
        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_conditions_skip_the_cycle() {
        let (tx, rx) = mpsc::channel(1);
        let count = Arc::new(AtomicU32::new(0));
        let cycle_count = count.clone();

        let scheduler = SyncScheduler::new(SchedulePolicy::default());
        let handle = tokio::spawn(scheduler.run(
            rx,
            || SystemConditions {
                network: NetworkKind::Offline,
                charging: false,
                battery_low: false,
            },
            move |_| {
                let count = cycle_count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
        ));

        tx.send(SyncRequest::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        drop(tx);
        handle.await.unwrap();
    }
}
