use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use turnstile::{
    AdmissionService, CounterStore, Decision, FixedWindow, LocalStore, ManualClock, Policy,
    PolicyKey, PolicySet, RequestIdentity, Scope, SlidingWindowLog, StoreError, TokenBucket,
};

/// Epoch millis test clocks start at; far from zero so subtraction bugs show.
pub const T0: u64 = 1_700_000_000_000;

pub fn fixed(id: &str, scope: Scope, limit: u64, window_secs: u64) -> Policy {
    Policy::new(id, scope, FixedWindow::new(limit, Duration::from_secs(window_secs)).unwrap())
}

pub fn sliding(id: &str, scope: Scope, limit: u64, window_secs: u64) -> Policy {
    Policy::new(id, scope, SlidingWindowLog::new(limit, Duration::from_secs(window_secs)).unwrap())
}

pub fn bucket(id: &str, scope: Scope, capacity: u64, refill_per_sec: f64) -> Policy {
    Policy::new(id, scope, TokenBucket::new(capacity, refill_per_sec).unwrap())
}

/// A global policy loose enough never to deny in tests that target other scopes.
pub fn open_global() -> Policy {
    fixed("global", Scope::Global, 1_000_000, 60)
}

pub fn from_ip(ip: &str) -> RequestIdentity {
    RequestIdentity::from_ip(ip)
}

/// Service over a shared local store and a manual clock.
pub struct Harness {
    pub service: AdmissionService,
    pub store: Arc<LocalStore>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(policies: PolicySet) -> Self {
        let store = Arc::new(LocalStore::new());
        let clock = ManualClock::new(T0);
        let service = AdmissionService::builder(policies)
            .store(store.clone())
            .clock(clock.clone())
            .build();
        Self { service, store, clock }
    }

    pub fn advance(&self, millis: u64) {
        self.clock.advance(millis);
    }

    pub async fn hit(&self, identity: &RequestIdentity, endpoint: &str) -> Decision {
        self.service.evaluate(identity, endpoint).await
    }
}

/// Local store that counts calls and can be made slow.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: LocalStore,
    calls: AtomicU64,
    delay: Duration,
}

impl CountingStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for CountingStore {
    async fn try_consume(
        &self,
        key: &PolicyKey,
        policy: &Policy,
        cost: u32,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.inner.consume(key, policy, cost, now_ms))
    }

    async fn evict_expired(&self, now_ms: u64) -> usize {
        self.inner.evict(now_ms)
    }
}

/// Store whose backend is down.
#[derive(Debug, Default)]
pub struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn try_consume(
        &self,
        _key: &PolicyKey,
        _policy: &Policy,
        _cost: u32,
        _now_ms: u64,
    ) -> Result<Decision, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn evict_expired(&self, _now_ms: u64) -> usize {
        0
    }
}

/// In-memory writer for asserting on formatted log output.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
