//! Per-domain politeness limiter.
//!
//! Every dispatch that touches a domain must first obtain a
//! [`DomainLease`]. A lease represents one unit of concurrency credit
//! against both the domain's global budget and the dispatching drone's
//! per-domain budget, and is released exactly once when the command
//! reaches a terminal state.
//!
//! # Admission Order
//!
//! `try_acquire` never waits. Under the paired locks it checks, in
//! order: cooldown, global concurrency, per-drone concurrency, per-drone
//! QPS (1-second sliding window). Admission appends to the QPS window
//! and, when burst tracking is enabled, to the burst window; filling the
//! burst window starts a cooldown and clears it.
//!
//! # Locking
//!
//! Two `parking_lot` mutexes taken in a fixed order (global state first,
//! then drone state). Nothing awaits while holding either.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use apiary_types::{DroneId, ErrorCode};

use crate::config::LimitsConfig;
use crate::metrics::record_domain_sessions;

/// Width of the QPS sliding window.
const QPS_WINDOW: Duration = Duration::from_secs(1);

/// Why an acquire was denied.
///
/// All denials are soft: the dispatch path waits briefly and requeues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    /// The (drone, domain) pair is cooling down after a burst.
    #[error("domain is cooling down after a burst")]
    Cooldown,
    /// The domain's global concurrency budget is exhausted.
    #[error("domain global concurrency limit reached")]
    GlobalConcurrency,
    /// The drone's concurrency budget on this domain is exhausted.
    #[error("per-drone domain concurrency limit reached")]
    PerDroneConcurrency,
    /// The drone exceeded its request rate on this domain.
    #[error("per-drone domain request rate exceeded")]
    PerDroneQps,
}

impl ErrorCode for DenyReason {
    fn code(&self) -> &'static str {
        match self {
            Self::Cooldown => "LIMIT_COOLDOWN",
            Self::GlobalConcurrency => "LIMIT_GLOBAL_CONCURRENCY",
            Self::PerDroneConcurrency => "LIMIT_PER_DRONE_CONCURRENCY",
            Self::PerDroneQps => "LIMIT_PER_DRONE_QPS",
        }
    }

    fn is_recoverable(&self) -> bool {
        // Every denial clears with time.
        true
    }
}

#[derive(Debug)]
struct GlobalState {
    concurrency: u32,
    last_touched: Instant,
}

#[derive(Debug)]
struct DroneState {
    concurrency: u32,
    /// Admission times within the last second.
    recent_requests: VecDeque<Instant>,
    /// Admission times within the burst (cooldown-length) window.
    burst_window: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    last_touched: Instant,
}

impl DroneState {
    fn new(now: Instant) -> Self {
        Self {
            concurrency: 0,
            recent_requests: VecDeque::new(),
            burst_window: VecDeque::new(),
            cooldown_until: None,
            last_touched: now,
        }
    }
}

#[derive(Debug)]
struct LimiterShared {
    limits: LimitsConfig,
    global: Mutex<HashMap<String, GlobalState>>,
    per_drone: Mutex<HashMap<(DroneId, String), DroneState>>,
}

/// Handle for one unit of domain-concurrency credit.
///
/// Releasing decrements the domain's global count and the owning drone's
/// count. Release is idempotent: dropping an already-released lease is a
/// no-op.
#[derive(Debug)]
pub struct DomainLease {
    shared: Arc<LimiterShared>,
    drone_id: DroneId,
    domain: String,
    released: AtomicBool,
}

impl DomainLease {
    /// The drone this lease was granted to.
    #[must_use]
    pub fn drone_id(&self) -> &DroneId {
        &self.drone_id
    }

    /// The registrable domain this lease counts against.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the concurrency credit. Safe to call more than once.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let active = {
            // Same order as acquisition: global first, then drone.
            let mut global = self.shared.global.lock();
            let mut per_drone = self.shared.per_drone.lock();
            let now = Instant::now();

            let active = if let Some(state) = global.get_mut(&self.domain) {
                state.concurrency = state.concurrency.saturating_sub(1);
                state.last_touched = now;
                state.concurrency
            } else {
                0
            };
            if let Some(state) =
                per_drone.get_mut(&(self.drone_id.clone(), self.domain.clone()))
            {
                state.concurrency = state.concurrency.saturating_sub(1);
                state.last_touched = now;
            }
            active
        };

        trace!(domain = %self.domain, drone = %self.drone_id, "released domain lease");
        record_domain_sessions(&self.domain, active);
    }
}

impl Drop for DomainLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Grants and tracks per-domain leases.
///
/// # Example
///
/// ```
/// use apiary_runtime::config::LimitsConfig;
/// use apiary_runtime::domain::DomainLimiter;
/// use apiary_types::DroneId;
///
/// let limiter = DomainLimiter::new(LimitsConfig::default());
/// let lease = limiter
///     .try_acquire(&DroneId::new("d1"), "example.com")
///     .expect("first acquire admits");
/// lease.release();
/// ```
#[derive(Debug, Clone)]
pub struct DomainLimiter {
    shared: Arc<LimiterShared>,
}

impl DomainLimiter {
    /// Creates a limiter with the given budgets.
    #[must_use]
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            shared: Arc::new(LimiterShared {
                limits,
                global: Mutex::new(HashMap::new()),
                per_drone: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attempts to lease one unit of concurrency for `drone_id` against
    /// `domain`. Non-blocking; never waits.
    ///
    /// The caller is expected to pass an already-registrable domain (the
    /// scheduler derives it from `task.domain` via the public-suffix
    /// index at submission); only lower-casing happens here.
    ///
    /// # Errors
    ///
    /// Returns the [`DenyReason`] when any budget is exhausted.
    pub fn try_acquire(
        &self,
        drone_id: &DroneId,
        domain: &str,
    ) -> Result<DomainLease, DenyReason> {
        self.try_acquire_at(drone_id, domain, Instant::now())
    }

    /// [`Self::try_acquire`] with an explicit clock, for deterministic
    /// window and cooldown tests.
    pub fn try_acquire_at(
        &self,
        drone_id: &DroneId,
        domain: &str,
        now: Instant,
    ) -> Result<DomainLease, DenyReason> {
        let domain = domain.to_lowercase();
        let limits = &self.shared.limits;

        let active = {
            let mut global = self.shared.global.lock();
            let mut per_drone = self.shared.per_drone.lock();

            let global_state = global.entry(domain.clone()).or_insert_with(|| GlobalState {
                concurrency: 0,
                last_touched: now,
            });
            let drone_state = per_drone
                .entry((drone_id.clone(), domain.clone()))
                .or_insert_with(|| DroneState::new(now));

            while let Some(&front) = drone_state.recent_requests.front() {
                if now.duration_since(front) >= QPS_WINDOW {
                    drone_state.recent_requests.pop_front();
                } else {
                    break;
                }
            }

            if let Some(until) = drone_state.cooldown_until {
                if now < until {
                    return Err(DenyReason::Cooldown);
                }
                drone_state.cooldown_until = None;
            }
            if global_state.concurrency >= limits.max_concurrent_sessions {
                return Err(DenyReason::GlobalConcurrency);
            }
            if drone_state.concurrency >= limits.concurrency_per_drone {
                return Err(DenyReason::PerDroneConcurrency);
            }
            if drone_state.recent_requests.len() as f64 >= limits.qps_per_drone {
                return Err(DenyReason::PerDroneQps);
            }

            drone_state.recent_requests.push_back(now);
            if limits.burst_limit > 0 {
                let burst_window = Duration::from_secs(limits.cooldown_seconds);
                while let Some(&front) = drone_state.burst_window.front() {
                    if now.duration_since(front) >= burst_window {
                        drone_state.burst_window.pop_front();
                    } else {
                        break;
                    }
                }
                drone_state.burst_window.push_back(now);
                if drone_state.burst_window.len() as u32 >= limits.burst_limit {
                    drone_state.cooldown_until = Some(now + burst_window);
                    drone_state.burst_window.clear();
                    debug!(
                        %domain,
                        drone = %drone_id,
                        cooldown_secs = limits.cooldown_seconds,
                        "burst limit reached, entering cooldown"
                    );
                }
            }

            global_state.concurrency += 1;
            global_state.last_touched = now;
            drone_state.concurrency += 1;
            drone_state.last_touched = now;
            global_state.concurrency
        };

        trace!(%domain, drone = %drone_id, "granted domain lease");
        record_domain_sessions(&domain, active);

        Ok(DomainLease {
            shared: Arc::clone(&self.shared),
            drone_id: drone_id.clone(),
            domain,
            released: AtomicBool::new(false),
        })
    }

    /// Drops idle domain state older than the configured TTL.
    ///
    /// Only states with zero concurrency are eligible; an entry holding
    /// live leases is never swept regardless of age.
    pub fn sweep_at(&self, now: Instant) {
        let ttl = Duration::from_secs(self.shared.limits.domain_state_ttl_seconds);
        let mut global = self.shared.global.lock();
        let mut per_drone = self.shared.per_drone.lock();

        let before = global.len() + per_drone.len();
        global.retain(|_, state| {
            state.concurrency > 0 || now.duration_since(state.last_touched) < ttl
        });
        per_drone.retain(|_, state| {
            state.concurrency > 0 || now.duration_since(state.last_touched) < ttl
        });
        let swept = before - (global.len() + per_drone.len());
        if swept > 0 {
            debug!(swept, "swept idle domain limiter state");
        }
    }

    /// Spawns the periodic sweep task, tied to the stop token.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        let ttl = self.shared.limits.domain_state_ttl_seconds;
        let interval = Duration::from_secs((ttl / 4).clamp(1, 60));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => limiter.sweep_at(Instant::now()),
                }
            }
        })
    }

    /// Number of tracked (domain, drone-domain) states, for tests.
    #[must_use]
    pub fn state_len(&self) -> (usize, usize) {
        (self.shared.global.lock().len(), self.shared.per_drone.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::assert_error_codes;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            max_concurrent_sessions: 25,
            concurrency_per_drone: 1,
            qps_per_drone: 2.0,
            burst_limit: 3,
            cooldown_seconds: 30,
            domain_state_ttl_seconds: 600,
        }
    }

    fn drone(n: u32) -> DroneId {
        DroneId::new(format!("d{n}"))
    }

    #[test]
    fn acquire_and_release() {
        let limiter = DomainLimiter::new(limits());
        let lease = limiter
            .try_acquire(&drone(1), "example.com")
            .expect("first acquire admits");
        assert_eq!(lease.domain(), "example.com");
        lease.release();

        // Released credit can be re-acquired... but QPS still applies.
        let now = Instant::now() + Duration::from_secs(2);
        limiter
            .try_acquire_at(&drone(1), "example.com", now)
            .expect("acquire after release");
    }

    #[test]
    fn domain_is_lowercased() {
        let limiter = DomainLimiter::new(limits());
        let lease = limiter
            .try_acquire(&drone(1), "Example.COM")
            .expect("acquire");
        assert_eq!(lease.domain(), "example.com");
    }

    #[test]
    fn per_drone_concurrency_cap() {
        let limiter = DomainLimiter::new(LimitsConfig {
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..limits()
        });
        let now = Instant::now();
        let _lease = limiter
            .try_acquire_at(&drone(1), "example.com", now)
            .expect("first acquire");
        let denied = limiter
            .try_acquire_at(&drone(1), "example.com", now)
            .expect_err("second concurrent acquire denied");
        assert_eq!(denied, DenyReason::PerDroneConcurrency);

        // A different drone has its own budget.
        limiter
            .try_acquire_at(&drone(2), "example.com", now)
            .expect("other drone admits");
    }

    #[test]
    fn global_concurrency_cap() {
        let limiter = DomainLimiter::new(LimitsConfig {
            max_concurrent_sessions: 2,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..limits()
        });
        let now = Instant::now();
        let _a = limiter
            .try_acquire_at(&drone(1), "example.com", now)
            .expect("first");
        let _b = limiter
            .try_acquire_at(&drone(2), "example.com", now)
            .expect("second");
        let denied = limiter
            .try_acquire_at(&drone(3), "example.com", now)
            .expect_err("global cap reached");
        assert_eq!(denied, DenyReason::GlobalConcurrency);

        // Another domain has an independent budget.
        limiter
            .try_acquire_at(&drone(3), "example.net", now)
            .expect("other domain admits");
    }

    #[test]
    fn qps_window_denies_then_slides() {
        let limiter = DomainLimiter::new(LimitsConfig {
            concurrency_per_drone: 10,
            qps_per_drone: 2.0,
            burst_limit: 0,
            ..limits()
        });
        let start = Instant::now();
        for i in 0..2 {
            limiter
                .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(i))
                .expect("within qps budget");
        }
        let denied = limiter
            .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(10))
            .expect_err("third request within one second denied");
        assert_eq!(denied, DenyReason::PerDroneQps);

        // After the window slides past the first two requests, admission
        // resumes.
        limiter
            .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(1100))
            .expect("window slid");
    }

    #[test]
    fn burst_triggers_cooldown_then_recovers() {
        let limiter = DomainLimiter::new(LimitsConfig {
            concurrency_per_drone: 10,
            qps_per_drone: 100.0,
            burst_limit: 3,
            cooldown_seconds: 5,
            ..limits()
        });
        let start = Instant::now();
        for i in 0..3u64 {
            limiter
                .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(i))
                .expect("burst budget");
        }
        let denied = limiter
            .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(10))
            .expect_err("fourth rapid acquire denied");
        assert_eq!(denied, DenyReason::Cooldown);

        // Cooldown entry cleared the burst window: once it elapses,
        // acquires succeed again.
        limiter
            .try_acquire_at(&drone(1), "example.com", start + Duration::from_secs(6))
            .expect("cooldown elapsed");
    }

    #[test]
    fn zero_burst_limit_disables_burst_tracking() {
        let limiter = DomainLimiter::new(LimitsConfig {
            concurrency_per_drone: 100,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..limits()
        });
        let start = Instant::now();
        for i in 0..20u64 {
            limiter
                .try_acquire_at(&drone(1), "example.com", start + Duration::from_millis(i))
                .expect("no burst tracking");
        }
    }

    #[test]
    fn release_is_idempotent() {
        let limiter = DomainLimiter::new(LimitsConfig {
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..limits()
        });
        let now = Instant::now();
        let lease = limiter
            .try_acquire_at(&drone(1), "example.com", now)
            .expect("acquire");
        lease.release();
        lease.release();
        drop(lease);

        // Had the double release decremented twice, two acquires would
        // now fit under a per-drone cap of one.
        let _second = limiter
            .try_acquire_at(&drone(1), "example.com", now + Duration::from_millis(1))
            .expect("one credit free");
        let denied = limiter
            .try_acquire_at(&drone(1), "example.com", now + Duration::from_millis(2))
            .expect_err("cap still enforced");
        assert_eq!(denied, DenyReason::PerDroneConcurrency);
    }

    #[test]
    fn drop_releases() {
        let limiter = DomainLimiter::new(LimitsConfig {
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..limits()
        });
        let now = Instant::now();
        {
            let _lease = limiter
                .try_acquire_at(&drone(1), "example.com", now)
                .expect("acquire");
        }
        limiter
            .try_acquire_at(&drone(1), "example.com", now + Duration::from_millis(1))
            .expect("credit returned on drop");
    }

    #[test]
    fn sweep_drops_only_idle_expired_state() {
        let limiter = DomainLimiter::new(LimitsConfig {
            qps_per_drone: 100.0,
            burst_limit: 0,
            domain_state_ttl_seconds: 600,
            ..limits()
        });
        let start = Instant::now();
        let held = limiter
            .try_acquire_at(&drone(1), "held.com", start)
            .expect("held lease");
        let released = limiter
            .try_acquire_at(&drone(2), "released.com", start)
            .expect("released lease");
        released.release();

        limiter.sweep_at(start + Duration::from_secs(601));
        let (global, per_drone) = limiter.state_len();
        // held.com survives (live lease); released.com is gone.
        assert_eq!(global, 1);
        assert_eq!(per_drone, 1);
        drop(held);
    }

    #[test]
    fn deny_reason_codes() {
        assert_error_codes(
            &[
                DenyReason::Cooldown,
                DenyReason::GlobalConcurrency,
                DenyReason::PerDroneConcurrency,
                DenyReason::PerDroneQps,
            ],
            "LIMIT_",
        );
        assert!(DenyReason::Cooldown.is_recoverable());
    }
}
