use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Source of the current time. Cycle code never calls `Utc::now()`
/// directly; everything reads the clock through this trait so artifact-age
/// and phase logic stay deterministic under test.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Source of client order ids.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Injected clock and id generation, passed to the engine and executor.
#[derive(Clone)]
pub struct CycleContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl CycleContext {
    pub fn system() -> Self {
        Self {
            time: Arc::new(SystemTime),
            id: Arc::new(RandomId),
        }
    }

    pub fn simulated(start: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(SimulatedTime::new(start)),
            id: Arc::new(SequentialId::default()),
        }
    }
}

pub struct SystemTime;

impl TimeProvider for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomId;

impl IdProvider for RandomId {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Millisecond-stepped fake clock for tests.
pub struct SimulatedTime {
    millis: AtomicI64,
}

impl SimulatedTime {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTime {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("simulated clock in range")
    }
}

#[derive(Default)]
pub struct SequentialId {
    counter: AtomicU64,
}

impl IdProvider for SequentialId {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("wheel-{:08}", n)
    }
}
