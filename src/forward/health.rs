//! Upstream health state machine
//!
//! Tracks whether the primary upstream is usable.  The forward path reads
//! the state with a single atomic load; the periodic probe task is the
//! only writer.
//!
//! # State Machine
//!
//! ```text
//!             probe fails
//! Healthy ───────────────────▶ Unhealthy (down_since = now)
//!    ▲                            │  │
//!    │  probe succeeds AND        │  │ probe fails
//!    │  now - down_since ≥ backoff│  ▼
//!    └────────────────────────────┘ down_since = now
//! ```
//!
//! The backoff resets on every failed probe: traffic only returns to the
//! primary once it has answered a probe *and* stayed probe-failure-free
//! for the whole backoff window.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

/// Health state values
const STATE_HEALTHY: u8 = 0;
const STATE_UNHEALTHY: u8 = 1;

/// Snapshot of health statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthStats {
    /// Total probes observed
    pub probes: u64,
    /// Probes that failed
    pub failed_probes: u64,
    /// Transitions into the unhealthy state
    pub unhealthy_transitions: u64,
    /// Recoveries back to healthy
    pub recoveries: u64,
    /// Whether the upstream is currently healthy
    pub is_healthy: bool,
}

/// Health state of a primary upstream
///
/// Initial state is healthy.
#[derive(Debug)]
pub struct UpstreamHealth {
    /// Current state, read lock-free on the forward path
    state: AtomicU8,

    /// When the primary was last observed down
    ///
    /// Only the probe task writes this; the lock is never contended on
    /// the hot path.
    down_since: RwLock<Option<Instant>>,

    /// Backoff window before a recovered primary takes traffic again
    backoff: Duration,

    probes: AtomicU64,
    failed_probes: AtomicU64,
    unhealthy_transitions: AtomicU64,
    recoveries: AtomicU64,
}

impl UpstreamHealth {
    /// Create a health tracker with the given backoff window
    #[must_use]
    pub fn new(backoff: Duration) -> Self {
        Self {
            state: AtomicU8::new(STATE_HEALTHY),
            down_since: RwLock::new(None),
            backoff,
            probes: AtomicU64::new(0),
            failed_probes: AtomicU64::new(0),
            unhealthy_transitions: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Check whether the primary should take traffic
    ///
    /// This is the forward path's only interaction with the state
    /// machine: one atomic load.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_HEALTHY
    }

    /// When the primary was last observed down, if it is down
    #[must_use]
    pub fn down_since(&self) -> Option<Instant> {
        *self.down_since.read()
    }

    /// Record a successful probe observed at `now`
    ///
    /// The primary recovers only when the backoff window has fully
    /// elapsed since the last failed probe.
    pub fn record_probe_success_at(&self, now: Instant) {
        self.probes.fetch_add(1, Ordering::Relaxed);

        if self.is_healthy() {
            return;
        }

        let down_since = *self.down_since.read();
        let backed_off = down_since
            .map_or(true, |since| now.saturating_duration_since(since) >= self.backoff);

        if backed_off {
            self.state.store(STATE_HEALTHY, Ordering::Release);
            *self.down_since.write() = None;
            self.recoveries.fetch_add(1, Ordering::Relaxed);

            info!("primary upstream recovered, returning traffic to it");
        }
    }

    /// Record a failed probe observed at `now`
    ///
    /// Advances the backoff even when already unhealthy.
    pub fn record_probe_failure_at(&self, now: Instant) {
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.failed_probes.fetch_add(1, Ordering::Relaxed);

        *self.down_since.write() = Some(now);

        if self.is_healthy() {
            self.state.store(STATE_UNHEALTHY, Ordering::Release);
            self.unhealthy_transitions.fetch_add(1, Ordering::Relaxed);

            warn!("primary upstream went down, bypassing to fallbacks");
        }
    }

    /// Record a successful probe observed now
    pub fn record_probe_success(&self) {
        self.record_probe_success_at(Instant::now());
    }

    /// Record a failed probe observed now
    pub fn record_probe_failure(&self) {
        self.record_probe_failure_at(Instant::now());
    }

    /// Snapshot of the health statistics
    #[must_use]
    pub fn stats(&self) -> HealthStats {
        HealthStats {
            probes: self.probes.load(Ordering::Relaxed),
            failed_probes: self.failed_probes.load(Ordering::Relaxed),
            unhealthy_transitions: self.unhealthy_transitions.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            is_healthy: self.is_healthy(),
        }
    }
}
