//! Per-key rolling-window rate limiting with role overrides.
//!
//! Each key gets a [`RateLimitTracker`] holding request timestamps behind
//! its own mutex; the limiter map itself is locked only for structural
//! mutation. Checks count requests inside rolling minute/hour/day windows
//! anchored at "now".

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Window names, in check order.
const WINDOWS: [(&str, i64); 3] = [
    ("requests_per_minute", 60),
    ("requests_per_hour", 3600),
    ("requests_per_day", 86_400),
];

/// Limits per rolling window. `Some(0)` or a negative value means the
/// window is always exceeded; `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<i64>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: Some(60),
            requests_per_hour: Some(1000),
            requests_per_day: Some(10_000),
        }
    }
}

impl RateLimits {
    /// Limits with every window unlimited.
    pub fn unlimited() -> Self {
        Self {
            requests_per_minute: None,
            requests_per_hour: None,
            requests_per_day: None,
        }
    }

    fn for_window(&self, name: &str) -> Option<i64> {
        match name {
            "requests_per_minute" => self.requests_per_minute,
            "requests_per_hour" => self.requests_per_hour,
            "requests_per_day" => self.requests_per_day,
            _ => None,
        }
    }

    /// Widest configured window in seconds, used for cleanup.
    fn widest_window_seconds(&self) -> Option<i64> {
        WINDOWS
            .iter()
            .filter(|(name, _)| self.for_window(name).is_some())
            .map(|(_, secs)| *secs)
            .max()
    }
}

/// Role-specific override. `exempt` bypasses all limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleOverride {
    #[serde(default)]
    pub exempt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_hour: Option<i64>,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub default_limits: RateLimits,
    #[serde(default)]
    pub role_overrides: HashMap<String, RoleOverride>,
    /// Seconds between opportunistic cleanups of stale tracker entries.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Tracks request timestamps for one key.
#[derive(Debug)]
pub struct RateLimitTracker {
    requests: Mutex<Vec<DateTime<Utc>>>,
}

impl RateLimitTracker {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, timestamp: DateTime<Utc>) {
        self.requests.lock().push(timestamp);
    }

    fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.requests.lock().iter().filter(|t| **t >= cutoff).count()
    }

    fn reset_time(&self, window_seconds: i64) -> Option<DateTime<Utc>> {
        self.requests
            .lock()
            .iter()
            .min()
            .map(|oldest| *oldest + chrono::Duration::seconds(window_seconds))
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        self.requests.lock().retain(|t| *t >= cutoff);
    }
}

/// Per-window snapshot included in decisions and status reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowStatus {
    pub current: usize,
    pub remaining: i64,
    pub limit: i64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub exceeded: bool,
    pub key: String,
    /// Window names that fired, e.g. `["requests_per_minute"]`.
    pub exceeded_limits: Vec<String>,
    pub reason: String,
    /// Per-window current/remaining/limit details.
    pub windows: BTreeMap<String, WindowStatus>,
    /// True when an exempt role bypassed all limits.
    #[serde(default)]
    pub exempt: bool,
}

impl RateLimitDecision {
    fn allowed(key: &str, reason: impl Into<String>) -> Self {
        Self {
            exceeded: false,
            key: key.to_string(),
            exceeded_limits: Vec::new(),
            reason: reason.into(),
            windows: BTreeMap::new(),
            exempt: false,
        }
    }

    /// Remaining requests in a window, if tracked.
    pub fn remaining(&self, window: &str) -> Option<i64> {
        self.windows.get(window).map(|w| w.remaining)
    }
}

/// Per-key rolling-window rate limiter with role overrides.
#[derive(Debug)]
pub struct RateLimiter {
    config: RwLock<RateLimiterConfig>,
    trackers: Mutex<HashMap<String, Arc<RateLimitTracker>>>,
    last_cleanup: Mutex<DateTime<Utc>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config: RwLock::new(config),
            trackers: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Utc::now()),
        }
    }

    /// Checks limits for a key, applying the role override when present.
    ///
    /// Resolution order: role override (including exemption) over defaults.
    /// Does not record a request.
    pub fn check(&self, key: &str, role: Option<&str>) -> RateLimitDecision {
        let config = self.config.read();

        if let Some(role) = role
            && let Some(role_config) = config.role_overrides.get(role)
        {
            if role_config.exempt {
                let mut decision =
                    RateLimitDecision::allowed(key, format!("Role {role} is exempt"));
                decision.exempt = true;
                return decision;
            }
            let limits = RateLimits {
                requests_per_minute: role_config
                    .max_requests_per_minute
                    .or(config.default_limits.requests_per_minute),
                requests_per_hour: role_config
                    .max_requests_per_hour
                    .or(config.default_limits.requests_per_hour),
                requests_per_day: config.default_limits.requests_per_day,
            };
            drop(config);
            return self.check_with_limits(key, &limits);
        }

        let limits = config.default_limits.clone();
        drop(config);
        self.check_with_limits(key, &limits)
    }

    /// Checks limits for a key using explicit limits, ignoring role
    /// overrides and defaults.
    pub fn check_with_limits(&self, key: &str, limits: &RateLimits) -> RateLimitDecision {
        self.maybe_cleanup();
        let tracker = self.tracker(key);
        let now = Utc::now();

        let mut exceeded_limits = Vec::new();
        let mut windows = BTreeMap::new();
        let mut reason = String::new();

        for (name, window_seconds) in WINDOWS {
            let Some(limit) = limits.for_window(name) else {
                continue;
            };

            // Zero or negative limit: always exceeded.
            if limit <= 0 {
                exceeded_limits.push(name.to_string());
                windows.insert(
                    name.to_string(),
                    WindowStatus {
                        current: 0,
                        remaining: 0,
                        limit,
                    },
                );
                if reason.is_empty() {
                    reason = format!("Zero rate limit configured for {name}");
                }
                continue;
            }

            let cutoff = now - chrono::Duration::seconds(window_seconds);
            let current = tracker.count_since(cutoff);
            let exceeded = current >= limit as usize;
            if exceeded {
                exceeded_limits.push(name.to_string());
                if reason.is_empty() {
                    reason = format!("Exceeded {name} limit: {current}/{limit}");
                }
            }
            windows.insert(
                name.to_string(),
                WindowStatus {
                    current,
                    remaining: (limit - current as i64).max(0),
                    limit,
                },
            );
        }

        let exceeded = !exceeded_limits.is_empty();
        if exceeded {
            tracing::warn!(key = key, reason = %reason, "rate limit exceeded");
        }

        RateLimitDecision {
            exceeded,
            key: key.to_string(),
            exceeded_limits,
            reason,
            windows,
            exempt: false,
        }
    }

    /// Records a request for a key. `timestamp` defaults to now; tests pass
    /// explicit timestamps to exercise window boundaries.
    pub fn record_request(&self, key: &str, timestamp: Option<DateTime<Utc>>) {
        let tracker = self.tracker(key);
        tracker.record(timestamp.unwrap_or_else(Utc::now));
        tracing::debug!(key = key, "recorded request");
    }

    /// Read-only status for a key: per-window current/remaining/limit and
    /// the reset time. Does not record a request.
    pub fn status(&self, key: &str, limits: Option<&RateLimits>) -> BTreeMap<String, WindowStatus> {
        let defaults = self.config.read().default_limits.clone();
        let limits = limits.unwrap_or(&defaults);
        let tracker = self.tracker(key);
        let now = Utc::now();

        let mut out = BTreeMap::new();
        for (name, window_seconds) in WINDOWS {
            let Some(limit) = limits.for_window(name) else {
                continue;
            };
            let cutoff = now - chrono::Duration::seconds(window_seconds);
            let current = tracker.count_since(cutoff);
            out.insert(
                name.to_string(),
                WindowStatus {
                    current,
                    remaining: (limit - current as i64).max(0),
                    limit,
                },
            );
        }
        out
    }

    /// Next time the oldest tracked request leaves the given window.
    pub fn reset_time(&self, key: &str, window_seconds: i64) -> Option<DateTime<Utc>> {
        self.tracker(key).reset_time(window_seconds)
    }

    /// Drops all tracked requests for a key.
    pub fn reset(&self, key: &str) {
        self.trackers.lock().remove(key);
        tracing::info!(key = key, "reset rate limits");
    }

    /// Replaces the default limits.
    pub fn set_default_limits(&self, limits: RateLimits) {
        self.config.write().default_limits = limits;
    }

    /// Every key with a tracker.
    pub fn all_keys(&self) -> Vec<String> {
        self.trackers.lock().keys().cloned().collect()
    }

    /// Prunes entries older than the widest configured window from every
    /// tracker. Safe to call concurrently with checks and records.
    pub fn cleanup(&self) {
        let Some(widest) = self.config.read().default_limits.widest_window_seconds() else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::seconds(widest);
        let trackers: Vec<Arc<RateLimitTracker>> =
            self.trackers.lock().values().cloned().collect();
        for tracker in trackers {
            tracker.prune_older_than(cutoff);
        }
        tracing::debug!("cleaned up stale rate limit entries");
    }

    fn maybe_cleanup(&self) {
        let interval = self.config.read().cleanup_interval_secs;
        let mut last = self.last_cleanup.lock();
        let now = Utc::now();
        if (now - *last).num_seconds() as u64 >= interval {
            *last = now;
            drop(last);
            self.cleanup();
        }
    }

    fn tracker(&self, key: &str) -> Arc<RateLimitTracker> {
        let mut trackers = self.trackers.lock();
        trackers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimitTracker::new()))
            .clone()
    }
}

static DEFAULT_LIMITER: Lazy<RwLock<Arc<RateLimiter>>> =
    Lazy::new(|| RwLock::new(Arc::new(RateLimiter::default())));

/// Process-wide default rate limiter.
pub fn default_rate_limiter() -> Arc<RateLimiter> {
    DEFAULT_LIMITER.read().clone()
}

/// Replaces the process-wide limiter; returns the previous instance.
/// Tests use this to substitute a fresh or configured limiter.
pub fn set_default_rate_limiter(limiter: Arc<RateLimiter>) -> Arc<RateLimiter> {
    std::mem::replace(&mut *DEFAULT_LIMITER.write(), limiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(minute: Option<i64>, hour: Option<i64>) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            default_limits: RateLimits {
                requests_per_minute: minute,
                requests_per_hour: hour,
                requests_per_day: None,
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_under_limit_allows() {
        let limiter = limiter_with(Some(5), Some(100));
        for _ in 0..4 {
            limiter.record_request("key", None);
        }
        let decision = limiter.check("key", None);
        assert!(!decision.exceeded);
        assert_eq!(decision.remaining("requests_per_minute"), Some(1));
    }

    #[test]
    fn test_rolling_minute_window() {
        let limiter = limiter_with(Some(3), None);
        for _ in 0..4 {
            limiter.record_request("key", None);
        }
        let decision = limiter.check("key", None);
        assert!(decision.exceeded);
        assert_eq!(decision.exceeded_limits, vec!["requests_per_minute"]);
        assert!(decision.reason.contains("requests_per_minute"));

        // Requests older than the window no longer count.
        limiter.reset("key");
        let stale = Utc::now() - chrono::Duration::seconds(61);
        for _ in 0..4 {
            limiter.record_request("key", Some(stale));
        }
        let decision = limiter.check("key", None);
        assert!(!decision.exceeded);
    }

    #[test]
    fn test_hour_window_counts_old_minute_entries() {
        let limiter = limiter_with(Some(100), Some(3));
        let two_minutes_ago = Utc::now() - chrono::Duration::seconds(120);
        for _ in 0..3 {
            limiter.record_request("key", Some(two_minutes_ago));
        }
        let decision = limiter.check("key", None);
        assert!(decision.exceeded);
        assert_eq!(decision.exceeded_limits, vec!["requests_per_hour"]);
    }

    #[test]
    fn test_zero_limit_always_exceeded() {
        let limiter = limiter_with(Some(0), None);
        let decision = limiter.check("fresh-key", None);
        assert!(decision.exceeded);
        assert!(decision.reason.contains("Zero rate limit"));
    }

    #[test]
    fn test_role_exemption() {
        let mut role_overrides = HashMap::new();
        role_overrides.insert(
            "admin".to_string(),
            RoleOverride {
                exempt: true,
                ..Default::default()
            },
        );
        let limiter = RateLimiter::new(RateLimiterConfig {
            default_limits: RateLimits {
                requests_per_minute: Some(1),
                ..RateLimits::unlimited()
            },
            role_overrides,
            ..Default::default()
        });

        for _ in 0..50 {
            limiter.record_request("key", None);
        }
        let decision = limiter.check("key", Some("admin"));
        assert!(!decision.exceeded);
        assert!(decision.exempt);

        let decision = limiter.check("key", None);
        assert!(decision.exceeded);
    }

    #[test]
    fn test_role_override_limits() {
        let mut role_overrides = HashMap::new();
        role_overrides.insert(
            "support".to_string(),
            RoleOverride {
                exempt: false,
                max_requests_per_minute: Some(3),
                max_requests_per_hour: Some(6),
            },
        );
        let limiter = RateLimiter::new(RateLimiterConfig {
            default_limits: RateLimits {
                requests_per_minute: Some(5),
                requests_per_hour: Some(10),
                requests_per_day: None,
            },
            role_overrides,
            ..Default::default()
        });

        for _ in 0..3 {
            limiter.record_request("k", None);
        }
        let decision = limiter.check("k", Some("support"));
        assert!(decision.exceeded);
        assert_eq!(decision.exceeded_limits, vec!["requests_per_minute"]);

        // Default limits would still allow.
        let decision = limiter.check("k", None);
        assert!(!decision.exceeded);
    }

    #[test]
    fn test_custom_limits_override_everything() {
        let limiter = RateLimiter::default();
        limiter.record_request("k", None);
        let decision = limiter.check_with_limits(
            "k",
            &RateLimits {
                requests_per_minute: Some(1),
                ..RateLimits::unlimited()
            },
        );
        assert!(decision.exceeded);
    }

    #[test]
    fn test_status_and_reset() {
        let limiter = limiter_with(Some(10), Some(100));
        limiter.record_request("k", None);
        limiter.record_request("k", None);

        let status = limiter.status("k", None);
        assert_eq!(status["requests_per_minute"].current, 2);
        assert_eq!(status["requests_per_minute"].remaining, 8);

        limiter.reset("k");
        let status = limiter.status("k", None);
        assert_eq!(status["requests_per_minute"].current, 0);
    }

    #[test]
    fn test_cleanup_prunes_stale_entries() {
        let limiter = limiter_with(Some(10), Some(100));
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        limiter.record_request("k", Some(two_hours_ago));
        limiter.record_request("k", None);

        limiter.cleanup();
        // Only the fresh request survives (widest window is one hour).
        let status = limiter.status("k", None);
        assert_eq!(status["requests_per_hour"].current, 1);
    }

    #[test]
    fn test_concurrent_checks_and_records() {
        let limiter = Arc::new(limiter_with(Some(1000), None));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    limiter.record_request("shared", None);
                    let _ = limiter.check("shared", None);
                    limiter.cleanup();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let status = limiter.status("shared", None);
        assert_eq!(status["requests_per_minute"].current, 400);
    }
}
