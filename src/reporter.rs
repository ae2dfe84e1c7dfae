//! Violation reporting.
//!
//! [`ViolationReporter::record`] is called on every denied request and must
//! never hold the request up: it touches only in-memory structures and pushes
//! to a bounded broadcast feed where slow consumers lose the oldest events.
//! Alongside the feed it keeps
//!
//! - the most recent records (bounded, drop-oldest),
//! - violation counts per key and per endpoint, bucketed by time,
//! - rolling per-key and per-endpoint rates that raise [`Alert`]s when they
//!   reach a threshold, with a global cap on alerts per suppression window.

use crate::algorithm::{LogState, SlidingWindowLog};
use crate::error::ConfigError;
use crate::store::lock;
use crate::telemetry::{AdmissionEvent, Alert, AlertScope, ViolationRecord};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default feed and recent-record capacity.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Alerting thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertConfig {
    /// Violations of one key within `window` that raise an alert; `None` disables.
    pub key_threshold: Option<u64>,
    /// Violations on one endpoint within `window` that raise an alert; `None` disables.
    pub endpoint_threshold: Option<u64>,
    /// Rolling window for both thresholds.
    pub window: Duration,
    /// Maximum alerts emitted per `suppression_window`; extras are counted and dropped.
    pub max_alerts: u64,
    /// Window for `max_alerts`.
    pub suppression_window: Duration,
    /// Width of the aggregation time buckets.
    pub bucket: Duration,
    /// How long aggregated buckets are kept.
    pub retention: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            key_threshold: Some(50),
            endpoint_threshold: Some(500),
            window: Duration::from_secs(60),
            max_alerts: 10,
            suppression_window: Duration::from_secs(300),
            bucket: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        }
    }
}

impl AlertConfig {
    /// Check that every window is non-zero and thresholds are positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_threshold =
            self.key_threshold == Some(0) || self.endpoint_threshold == Some(0);
        if zero_threshold || self.max_alerts == 0 {
            return Err(ConfigError::InvalidSetting("alert thresholds must be > 0".into()));
        }
        let windows = [self.window, self.suppression_window, self.bucket, self.retention];
        if windows.iter().any(|w| w.as_millis() == 0) {
            return Err(ConfigError::InvalidSetting("alert windows must be >= 1ms".into()));
        }
        Ok(())
    }
}

/// Violations counted for one target in one time bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCount {
    /// Key or endpoint.
    pub scope: AlertScope,
    /// The key or endpoint value.
    pub target: Arc<str>,
    /// Epoch millis the bucket starts at.
    pub bucket_start_ms: u64,
    /// Violations in the bucket.
    pub count: u64,
}

/// Point-in-time reporter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReporterSnapshot {
    /// Violations recorded since creation.
    pub recorded: u64,
    /// Records pushed out of the recent buffer.
    pub dropped: u64,
    /// Alerts swallowed by suppression.
    pub suppressed_alerts: u64,
    /// Aggregated counts, ordered by bucket then target.
    pub buckets: Vec<BucketCount>,
}

type Target = (AlertScope, Arc<str>);

/// Collects violations, aggregates them and feeds observers.
#[derive(Debug)]
pub struct ViolationReporter {
    feed: broadcast::Sender<AdmissionEvent>,
    recent: Mutex<VecDeque<ViolationRecord>>,
    capacity: usize,
    buckets: DashMap<(AlertScope, Arc<str>, u64), u64>,
    rates: DashMap<Target, Mutex<LogState>>,
    suppressor: Mutex<LogState>,
    config: ArcSwap<AlertConfig>,
    recorded: AtomicU64,
    dropped: AtomicU64,
    suppressed: AtomicU64,
}

impl Default for ViolationReporter {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY, AlertConfig::default())
    }
}

impl ViolationReporter {
    /// Reporter whose feed and recent buffer hold `capacity` events (min 1).
    pub fn new(capacity: usize, alerts: AlertConfig) -> Self {
        let capacity = capacity.max(1);
        let (feed, _) = broadcast::channel(capacity);
        Self {
            feed,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            buckets: DashMap::new(),
            rates: DashMap::new(),
            suppressor: Mutex::new(LogState::default()),
            config: ArcSwap::from_pointee(alerts),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Swap alert thresholds. Rolling rates restart from zero.
    pub fn reconfigure(&self, alerts: AlertConfig) {
        if **self.config.load() != alerts {
            self.config.store(Arc::new(alerts));
            self.rates.clear();
        }
    }

    /// Current alert thresholds.
    pub fn alert_config(&self) -> Arc<AlertConfig> {
        self.config.load_full()
    }

    /// Subscribe to the event feed. Receivers that fall behind lose the
    /// oldest events and see `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionEvent> {
        self.feed.subscribe()
    }

    /// Publish a non-violation event (breaker transitions, degraded mode).
    pub fn publish(&self, event: AdmissionEvent) {
        // No subscribers is fine.
        let _ = self.feed.send(event);
    }

    /// Record a denied request. Never blocks on I/O and never fails.
    pub fn record(&self, record: ViolationRecord) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let config = self.config.load_full();
        let now_ms = record.timestamp_ms;

        let bucket_ms = millis(config.bucket).max(1);
        let bucket_start = now_ms - now_ms % bucket_ms;
        *self.buckets.entry((AlertScope::Key, record.key.clone(), bucket_start)).or_insert(0) += 1;
        *self
            .buckets
            .entry((AlertScope::Endpoint, record.endpoint.clone(), bucket_start))
            .or_insert(0) += 1;

        let mut alerts = Vec::new();
        if let Some(threshold) = config.key_threshold {
            alerts.extend(self.track(&config, AlertScope::Key, &record.key, threshold, now_ms));
        }
        if let Some(threshold) = config.endpoint_threshold {
            alerts.extend(self.track(
                &config,
                AlertScope::Endpoint,
                &record.endpoint,
                threshold,
                now_ms,
            ));
        }

        {
            let mut recent = lock(&self.recent);
            if recent.len() >= self.capacity {
                recent.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            recent.push_back(record.clone());
        }

        tracing::debug!(key = %record.key, endpoint = %record.endpoint, "violation recorded");
        self.publish(AdmissionEvent::Violation(record));
        for alert in alerts {
            self.publish(AdmissionEvent::Alert(alert));
        }
    }

    // Returns an alert when this violation brings the target's rolling count to the threshold.
    fn track(
        &self,
        config: &AlertConfig,
        scope: AlertScope,
        target: &Arc<str>,
        threshold: u64,
        now_ms: u64,
    ) -> Option<Alert> {
        let log = SlidingWindowLog::new(threshold, config.window).ok()?;
        let reached = {
            let entry = self.rates.entry((scope, target.clone())).or_default();
            let mut state = lock(entry.value());
            let d = log.try_consume(&mut state, 1, now_ms);
            d.allowed && d.remaining == 0
        };
        if !reached || !self.admit_alert(config, now_ms) {
            return None;
        }
        tracing::warn!(
            scope = scope.as_str(),
            target = %target,
            violations = threshold,
            window_ms = millis(config.window),
            "violation rate alert"
        );
        Some(Alert {
            scope,
            target: target.clone(),
            violations: threshold,
            window: config.window,
            at_ms: now_ms,
        })
    }

    fn admit_alert(&self, config: &AlertConfig, now_ms: u64) -> bool {
        let Ok(cap) = SlidingWindowLog::new(config.max_alerts, config.suppression_window) else {
            return true;
        };
        let admitted = cap.try_consume(&mut lock(&self.suppressor), 1, now_ms).allowed;
        if !admitted {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("alert suppressed");
        }
        admitted
    }

    /// Most recent violations, oldest first.
    pub fn recent(&self) -> Vec<ViolationRecord> {
        lock(&self.recent).iter().cloned().collect()
    }

    /// Total violations for one key or endpoint across retained buckets.
    pub fn count(&self, scope: AlertScope, target: &str) -> u64 {
        self.buckets
            .iter()
            .filter(|e| e.key().0 == scope && &*e.key().1 == target)
            .map(|e| *e.value())
            .sum()
    }

    /// Counters and aggregated buckets.
    pub fn snapshot(&self) -> ReporterSnapshot {
        let mut buckets: Vec<BucketCount> = self
            .buckets
            .iter()
            .map(|e| {
                let (scope, target, bucket_start_ms) = e.key().clone();
                BucketCount { scope, target, bucket_start_ms, count: *e.value() }
            })
            .collect();
        buckets.sort_by(|a, b| {
            (a.bucket_start_ms, a.scope.as_str(), &a.target).cmp(&(
                b.bucket_start_ms,
                b.scope.as_str(),
                &b.target,
            ))
        });
        ReporterSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            suppressed_alerts: self.suppressed.load(Ordering::Relaxed),
            buckets,
        }
    }

    /// Drop buckets past retention and idle rate trackers.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let config = self.config.load_full();
        let retention = millis(config.retention);
        let window = millis(config.window);
        let before = self.buckets.len() + self.rates.len();
        self.buckets.retain(|(_, _, start), _| now_ms.saturating_sub(*start) < retention);
        self.rates.retain(|_, state| {
            lock(state).last_admitted_ms().is_some_and(|t| now_ms.saturating_sub(t) < window)
        });
        before.saturating_sub(self.buckets.len() + self.rates.len())
    }

    /// Forward every feed event to `sink` from a background task.
    ///
    /// Events the task falls behind on are skipped and logged. The task ends
    /// when the reporter is dropped.
    pub fn forward_to<S>(&self, mut sink: S) -> JoinHandle<()>
    where
        S: tower::Service<AdmissionEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => deliver(&mut sink, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "telemetry forwarder lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Hand one event to `sink`; a failing sink loses the event, not the feed.
async fn deliver<S>(sink: &mut S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()>,
    S::Error: std::error::Error,
{
    use tower::ServiceExt;
    let result = match sink.ready().await {
        Ok(ready) => ready.call(event).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "telemetry sink rejected event");
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
