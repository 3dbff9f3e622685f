//! Admission control for inbound messages.
//!
//! Each connection owns an [`AdmissionController`] on its read path: a
//! lazily refilled token bucket plus an optional [`GlobalCap`] shared by all
//! connections. The controller only sees timing, never message content.
//!
//! # Escalation
//!
//! Rejections count as violations. Once more than `violation_threshold`
//! violations pile up inside one bucket window the controller answers
//! [`Decision::Disconnect`] exactly once and stays latched afterwards. The
//! count resets when a message is admitted a full bucket window after the
//! last rejection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

/// Outcome of [`AdmissionController::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Drop the message and tell the sender to slow down
    Throttle { retry_after: Duration },
    /// Drop the message and close the connection
    Disconnect,
}

// ============================================================================
// Token Bucket
// ============================================================================

/// Per-connection token bucket, refilled from elapsed time on each check.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last = now;
        }
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Gives back a token taken for a message that was rejected elsewhere.
    pub fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Time until one token is available.
    pub fn retry_after(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }

    /// Time to refill an empty bucket.
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.refill_per_sec)
    }
}

// ============================================================================
// Global Cap
// ============================================================================

/// Process-wide fixed one-second window, shared by all connections.
///
/// Lock-free: the window index and the count are plain atomics. A burst
/// straddling a window boundary may briefly admit up to twice the limit.
#[derive(Debug)]
pub struct GlobalCap {
    limit: u32,
    epoch: Instant,
    window: AtomicU64,
    count: AtomicU32,
}

impl GlobalCap {
    /// Returns `None` when `limit_per_sec` is 0 (cap disabled).
    pub fn new(limit_per_sec: u32) -> Option<Arc<Self>> {
        (limit_per_sec > 0).then(|| {
            Arc::new(Self {
                limit: limit_per_sec,
                epoch: Instant::now(),
                window: AtomicU64::new(0),
                count: AtomicU32::new(0),
            })
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let current = now.saturating_duration_since(self.epoch).as_secs();
        let seen = self.window.load(Ordering::Acquire);
        if current > seen
            && self
                .window
                .compare_exchange(seen, current, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::AcqRel) < self.limit
    }

    /// Time until the next window opens.
    pub fn retry_after(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.epoch);
        let into_window = elapsed.subsec_nanos();
        Duration::from_secs(1).saturating_sub(Duration::from_nanos(u64::from(into_window)))
    }
}

// ============================================================================
// Admission Controller
// ============================================================================

#[derive(Debug)]
pub struct AdmissionController {
    bucket: TokenBucket,
    global: Option<Arc<GlobalCap>>,
    violation_threshold: u32,
    violations: u32,
    last_rejection: Option<Instant>,
    escalated: bool,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig, global: Option<Arc<GlobalCap>>, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(config.bucket_size, config.refill_per_sec, now),
            global,
            violation_threshold: config.violation_threshold,
            violations: 0,
            last_rejection: None,
            escalated: false,
        }
    }

    pub fn allow(&mut self) -> Decision {
        self.allow_at(Instant::now())
    }

    /// Evaluates one inbound message arriving at `now`.
    pub fn allow_at(&mut self, now: Instant) -> Decision {
        if self.escalated {
            return Decision::Throttle {
                retry_after: self.bucket.retry_after(),
            };
        }

        if !self.bucket.try_take(now) {
            self.violations = self.violations.saturating_add(1);
            self.last_rejection = Some(now);
            if self.violations > self.violation_threshold {
                self.escalated = true;
                warn!(
                    violations = self.violations,
                    threshold = self.violation_threshold,
                    "Rate limit violations exceeded threshold"
                );
                return Decision::Disconnect;
            }
            return Decision::Throttle {
                retry_after: self.bucket.retry_after(),
            };
        }

        if let Some(global) = &self.global {
            if !global.try_acquire_at(now) {
                // Aggregate load is nobody's fault in particular
                self.bucket.refund();
                debug!(limit = global.limit(), "Global admission cap reached");
                return Decision::Throttle {
                    retry_after: global.retry_after(now),
                };
            }
        }

        let calm = self
            .last_rejection
            .map_or(true, |at| now.saturating_duration_since(at) >= self.bucket.window());
        if calm {
            self.violations = 0;
        }
        Decision::Allow
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bucket: u32, refill: f64, threshold: u32) -> AdmissionConfig {
        AdmissionConfig {
            bucket_size: bucket,
            refill_per_sec: refill,
            violation_threshold: threshold,
            ..AdmissionConfig::default()
        }
    }

    #[test]
    fn test_bucket_allows_burst_then_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, 1.0, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));
        assert!(!bucket.try_take(start + Duration::from_millis(500)));
        assert!(bucket.try_take(start + Duration::from_millis(1000)));
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 10.0, start);
        let later = start + Duration::from_secs(60);
        assert!(bucket.try_take(later));
        assert!(bucket.try_take(later));
        assert!(!bucket.try_take(later));
    }

    #[test]
    fn test_flood_is_limited_and_disconnected_once() {
        // 100 messages in one second, bucket 10, refill 5/s
        let start = Instant::now();
        let mut ctrl = AdmissionController::new(&config(10, 5.0, 20), None, start);

        let mut admitted = 0;
        let mut disconnects = 0;
        for i in 0..100u64 {
            match ctrl.allow_at(start + Duration::from_millis(i * 10)) {
                Decision::Allow => admitted += 1,
                Decision::Throttle { .. } => {}
                Decision::Disconnect => disconnects += 1,
            }
        }

        assert!(admitted >= 10 && admitted <= 15, "admitted {admitted}");
        assert_eq!(disconnects, 1);
        assert!(ctrl.is_escalated());
    }

    #[test]
    fn test_escalation_latches() {
        let start = Instant::now();
        let mut ctrl = AdmissionController::new(&config(1, 0.001, 2), None, start);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        assert!(matches!(ctrl.allow_at(start), Decision::Throttle { .. }));
        assert!(matches!(ctrl.allow_at(start), Decision::Throttle { .. }));
        assert_eq!(ctrl.allow_at(start), Decision::Disconnect);
        for _ in 0..10 {
            assert_ne!(ctrl.allow_at(start), Decision::Disconnect);
        }
    }

    #[test]
    fn test_compliant_sender_recovers() {
        let start = Instant::now();
        let mut ctrl = AdmissionController::new(&config(2, 1.0, 5), None, start);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        assert!(matches!(ctrl.allow_at(start), Decision::Throttle { .. }));
        assert_eq!(ctrl.violations(), 1);

        // A full window (2s) after the last rejection the count resets
        assert_eq!(ctrl.allow_at(start + Duration::from_secs(3)), Decision::Allow);
        assert_eq!(ctrl.violations(), 0);
    }

    #[test]
    fn test_violations_accumulate_across_admitted_messages() {
        // Rejections need not be consecutive: an admitted message inside the
        // calm window does not clear the count
        let start = Instant::now();
        let mut ctrl = AdmissionController::new(&config(2, 1.0, 3), None, start);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        for secs in 0..3 {
            let at = start + Duration::from_secs(secs);
            if secs > 0 {
                assert_eq!(ctrl.allow_at(at), Decision::Allow);
            }
            assert!(matches!(ctrl.allow_at(at), Decision::Throttle { .. }));
        }
        assert_eq!(ctrl.violations(), 3);

        let at = start + Duration::from_secs(3);
        assert_eq!(ctrl.allow_at(at), Decision::Allow);
        assert_eq!(ctrl.allow_at(at), Decision::Disconnect);
    }

    #[test]
    fn test_throttle_reports_retry_after() {
        let start = Instant::now();
        let mut ctrl = AdmissionController::new(&config(1, 4.0, 10), None, start);
        assert_eq!(ctrl.allow_at(start), Decision::Allow);
        match ctrl.allow_at(start) {
            Decision::Throttle { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(250));
            }
            other => panic!("Expected throttle, got {other:?}"),
        }
    }

    #[test]
    fn test_global_cap_disabled_at_zero() {
        assert!(GlobalCap::new(0).is_none());
    }

    #[test]
    fn test_global_cap_is_shared_and_not_a_violation() {
        let start = Instant::now();
        let global = GlobalCap::new(3);
        let mut a = AdmissionController::new(&config(10, 1.0, 0), global.clone(), start);
        let mut b = AdmissionController::new(&config(10, 1.0, 0), global.clone(), start);

        assert_eq!(a.allow_at(start), Decision::Allow);
        assert_eq!(b.allow_at(start), Decision::Allow);
        assert_eq!(a.allow_at(start), Decision::Allow);
        assert!(matches!(b.allow_at(start), Decision::Throttle { .. }));
        // threshold 0 would disconnect on the first violation
        assert_eq!(b.violations(), 0);
        assert!(!b.is_escalated());

        let next_window = start + Duration::from_millis(1100);
        assert_eq!(b.allow_at(next_window), Decision::Allow);
    }
}
