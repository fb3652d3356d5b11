//! Multi-signal rate-limit detection with adaptive cooldown
//!
//! The detector is consulted by every endpoint worker after each upstream
//! exchange. Four independent signals are evaluated (HTTP status, body
//! keywords, recent failure rate, transport timeout); any positive signal
//! yields a rate-limited verdict. Cooldowns grow exponentially with
//! consecutive strikes and honour `Retry-After` when the upstream sends one.

use crate::config::RateLimitConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP statuses treated as rate-limit responses.
/// 403 is included because several providers answer quota exhaustion with
/// it, but it can also indicate credential problems; the first 403-driven
/// detection per endpoint is logged for operator review.
const RATE_LIMIT_STATUSES: [u16; 3] = [429, 503, 403];

/// Substrings that mark a response or error text as rate-limiting
const RATE_LIMIT_KEYWORDS: [&str; 6] = [
    "rate limit",
    "too many requests",
    "exceeded",
    "quota",
    "throttle",
    "too many",
];

/// Minimum sample count before the failure-rate signal may fire
const FAILURE_RATE_MIN_SAMPLES: usize = 5;

/// What the worker observed from one upstream exchange
#[derive(Debug, Default)]
pub struct UpstreamObservation<'a> {
    /// HTTP status, when the exchange completed
    pub status: Option<u16>,
    /// Parsed response body, when it was valid JSON
    pub body: Option<&'a Value>,
    /// Parsed `Retry-After` header
    pub retry_after: Option<Duration>,
    /// Transport error text, when the exchange failed
    pub error_message: Option<&'a str>,
    /// Transport-level timeout or aborted connection
    pub timed_out: bool,
}

/// Which of the four signals fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub http_status: bool,
    pub keyword: bool,
    pub failure_rate: bool,
    pub timeout: bool,
}

impl Signals {
    fn positives(&self) -> u32 {
        self.http_status as u32
            + self.keyword as u32
            + self.failure_rate as u32
            + self.timeout as u32
    }

    pub fn any(&self) -> bool {
        self.positives() > 0
    }
}

/// Detection result for one observation
#[derive(Debug, Clone)]
pub struct Verdict {
    pub rate_limited: bool,
    pub cooldown: Duration,
    /// Fraction of signals positive (0.25, 0.50, 0.75, 1.00)
    pub confidence: f64,
    pub signals: Signals,
}

impl Verdict {
    fn negative(signals: Signals) -> Self {
        Self {
            rate_limited: false,
            cooldown: Duration::ZERO,
            confidence: 0.0,
            signals,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    /// Consecutive rate-limit detections; reset on any non-rate-limited
    /// verdict, on cooldown expiry and on health-probe success
    strikes: u32,
    /// Rate-limit events recorded during this process lifetime
    session_events: u64,
    /// Persisted 7-day average cooldown, consulted until the first event
    /// of this process lifetime
    seeded_avg_ms: Option<u64>,
    /// Recent request outcomes, newest at the back
    recent: VecDeque<bool>,
    warned_auth_status: bool,
}

/// Stateless-per-call analyzer with per-endpoint strike counters
pub struct RateLimitDetector {
    cfg: RateLimitConfig,
    endpoints: DashMap<i64, EndpointState>,
}

impl RateLimitDetector {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            endpoints: DashMap::new(),
        }
    }

    /// Seed an endpoint with persisted history at startup: the 7-day average
    /// cooldown and the most recent request outcomes (chronological order)
    pub fn seed_history(&self, endpoint_id: i64, avg_cooldown_ms: Option<u64>, outcomes: &[bool]) {
        let mut state = self.endpoints.entry(endpoint_id).or_default();
        state.seeded_avg_ms = avg_cooldown_ms;
        state.recent = outcomes
            .iter()
            .rev()
            .take(self.cfg.history_window_size)
            .rev()
            .copied()
            .collect();
    }

    /// Record the outcome of a completed (non-rate-limited) upstream call
    pub fn record_outcome(&self, endpoint_id: i64, success: bool) {
        let mut state = self.endpoints.entry(endpoint_id).or_default();
        state.recent.push_back(success);
        while state.recent.len() > self.cfg.history_window_size {
            state.recent.pop_front();
        }
    }

    /// Reset the consecutive-strike counter (cooldown expiry, probe success)
    pub fn reset_strikes(&self, endpoint_id: i64) {
        if let Some(mut state) = self.endpoints.get_mut(&endpoint_id) {
            state.strikes = 0;
        }
    }

    pub fn strikes(&self, endpoint_id: i64) -> u32 {
        self.endpoints
            .get(&endpoint_id)
            .map(|s| s.strikes)
            .unwrap_or(0)
    }

    /// Analyze one upstream exchange
    pub fn detect(&self, endpoint_id: i64, obs: &UpstreamObservation<'_>) -> Verdict {
        let mut state = self.endpoints.entry(endpoint_id).or_default();

        let mut signals = Signals::default();

        if let Some(status) = obs.status {
            signals.http_status = RATE_LIMIT_STATUSES.contains(&status);
            if signals.http_status && status == 403 && !state.warned_auth_status {
                state.warned_auth_status = true;
                warn!(
                    endpoint_id,
                    "endpoint answered 403; treating as rate limit, but check credentials"
                );
            }
        }

        let haystack = keyword_haystack(obs.body, obs.error_message);
        signals.keyword = RATE_LIMIT_KEYWORDS.iter().any(|kw| haystack.contains(kw));

        if state.recent.len() >= FAILURE_RATE_MIN_SAMPLES {
            let failed = state.recent.iter().filter(|ok| !**ok).count();
            let failure_rate = failed as f64 / state.recent.len() as f64;
            signals.failure_rate = failure_rate >= self.cfg.detection_threshold;
        }

        signals.timeout = obs.timed_out
            || obs
                .error_message
                .map(|m| m.to_lowercase().contains("timeout"))
                .unwrap_or(false);

        if !signals.any() {
            state.strikes = 0;
            return Verdict::negative(signals);
        }

        let confidence = signals.positives() as f64 / 4.0;

        let cooldown_ms = if let Some(retry_after) = obs.retry_after {
            // Upstream told us exactly how long to wait
            (retry_after.as_millis() as u64).min(self.cfg.max_cooldown_ms)
        } else {
            let mut chosen = self.backoff_cooldown_ms(state.strikes);
            if state.session_events == 0 {
                // First event since startup: let persisted history raise the
                // floor above the base backoff
                if let Some(avg) = state.seeded_avg_ms {
                    if avg > chosen {
                        chosen = avg.min(self.cfg.max_cooldown_ms);
                    }
                }
            }
            chosen
        };

        state.strikes += 1;
        state.session_events += 1;

        debug!(
            endpoint_id,
            cooldown_ms,
            confidence,
            strikes = state.strikes,
            ?signals,
            "rate limit detected"
        );

        Verdict {
            rate_limited: true,
            cooldown: Duration::from_millis(cooldown_ms),
            confidence,
            signals,
        }
    }

    fn backoff_cooldown_ms(&self, strikes: u32) -> u64 {
        let computed =
            self.cfg.min_cooldown_ms as f64 * self.cfg.backoff_multiplier.powi(strikes as i32);
        computed.clamp(
            self.cfg.min_cooldown_ms as f64,
            self.cfg.max_cooldown_ms as f64,
        ) as u64
    }
}

/// Lowercased text searched by the keyword signal: the response body (string
/// body, `error.message`, or the serialized JSON) plus the transport error
fn keyword_haystack(body: Option<&Value>, error_message: Option<&str>) -> String {
    let mut haystack = String::new();
    if let Some(value) = body {
        match value {
            Value::String(s) => haystack.push_str(s),
            _ => {
                if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
                    haystack.push_str(message);
                } else {
                    haystack.push_str(&value.to_string());
                }
            }
        }
    }
    if let Some(message) = error_message {
        haystack.push(' ');
        haystack.push_str(message);
    }
    haystack.to_lowercase()
}

/// Parse a `Retry-After` header value: integer seconds or HTTP-date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
