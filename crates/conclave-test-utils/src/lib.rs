//! Shared test utilities, gauges, and fixtures for Conclave crates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::{EventSink, Processor};
use conclave_core::types::{DataMap, Event, EventKind};

/// Build a `DataMap` from `(key, value)` pairs.
pub fn data<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> DataMap {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Shared, ordered log of processor invocations.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }

    /// Position of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }
}

/// Records its label in a [`CallLog`], then echoes inputs plus `{label: true}`.
pub struct RecordingProcessor {
    label: String,
    log: CallLog,
    delay: Duration,
}

impl RecordingProcessor {
    pub fn new(label: impl Into<String>, log: CallLog) -> Self {
        Self {
            label: label.into(),
            log,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Processor for RecordingProcessor {
    fn process(
        &self,
        _cancel: CancellationToken,
        mut inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.push(self.label.clone());
            inputs.insert(self.label.clone(), serde_json::Value::Bool(true));
            Ok(inputs)
        })
    }
}

/// Always fails with a handler error.
pub struct FailingProcessor {
    message: String,
}

impl FailingProcessor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Processor for FailingProcessor {
    fn process(
        &self,
        _cancel: CancellationToken,
        _inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(async move {
            Err(ConclaveError::handler(
                "failing-processor",
                self.message.clone(),
            ))
        })
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyProcessor {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyProcessor {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for FlakyProcessor {
    fn process(
        &self,
        _cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ConclaveError::handler("flaky-processor", format!("failure {}", call + 1)))
            } else {
                Ok(inputs)
            }
        })
    }
}

/// Sleeps for `delay`, returning early with `Cancelled` if the token fires.
pub struct SlowProcessor {
    delay: Duration,
}

impl SlowProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Processor for SlowProcessor {
    fn process(
        &self,
        cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(inputs),
                _ = cancel.cancelled() => Err(ConclaveError::Cancelled),
            }
        })
    }
}

/// Tracks how many invocations overlap in time.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// A processor that holds a slot in this gauge for `hold`.
    pub fn processor(&self, hold: Duration) -> GaugeProcessor {
        GaugeProcessor {
            gauge: self.clone(),
            hold,
        }
    }
}

pub struct GaugeProcessor {
    gauge: ConcurrencyGauge,
    hold: Duration,
}

impl Processor for GaugeProcessor {
    fn process(
        &self,
        _cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(async move {
            let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.gauge.current.fetch_sub(1, Ordering::SeqCst);
            self.gauge.total.fetch_add(1, Ordering::SeqCst);
            Ok(inputs)
        })
    }
}

/// Collects every event of the given kinds from an event sink.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventCollector {
    pub fn attach(sink: &dyn EventSink, kinds: &[EventKind]) -> Self {
        let collector = Self::default();
        for kind in kinds {
            let events = collector.events.clone();
            sink.subscribe(
                *kind,
                Arc::new(move |event: &Event| events.lock().push(event.clone())),
            );
        }
        collector
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
