//! Typed event dispatch.
//!
//! Each registered observer is driven by its own task fed through an
//! unbounded channel, so one slow callback never delays delivery to the
//! others while every observer still sees events in arrival order.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::stream::proto::EventFrame;
use crate::stream::state::ConnectionState;

/// Metric carried by an event frame, keyed by the frame's `t` tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricKind {
    HeartRate,
    Steps,
    Distance,
}

impl MetricKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "HEART_RATE" => Some(MetricKind::HeartRate),
            "STEPS" => Some(MetricKind::Steps),
            "DISTANCE" => Some(MetricKind::Distance),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            MetricKind::HeartRate => "HEART_RATE",
            MetricKind::Steps => "STEPS",
            MetricKind::Distance => "DISTANCE",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One telemetry reading as delivered to observers.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub value: f64,
    /// Server sequence number, when the frame carried one.
    pub seq: Option<u64>,
    /// Local arrival time. Arrival order is the only ordering guarantee.
    pub received_at: Instant,
}

/// State change reported to lifecycle observers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

type Pump = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One observer's lane. The pump task is spawned on the first runtime that
/// sees the observer, so registration works outside a runtime.
struct Observer<T> {
    tx: mpsc::UnboundedSender<T>,
    pump: Mutex<Option<Pump>>,
}

impl<T> Observer<T>
where
    T: Send + 'static,
{
    fn new<F>(mut callback: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump: Pump = Box::pin(async move {
            while let Some(item) = rx.recv().await {
                callback(item);
            }
        });
        let observer = Self {
            tx,
            pump: Mutex::new(Some(pump)),
        };
        observer.start();
        observer
    }

    fn start(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_none() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            if let Some(pump) = pump.take() {
                handle.spawn(pump);
            }
        }
    }

    /// Queues `item`; returns false once the observer's task has gone away.
    fn deliver(&self, item: T) -> bool {
        if self.tx.send(item).is_err() {
            return false;
        }
        self.start();
        true
    }
}

struct SampleObserver {
    filter: Option<MetricKind>,
    observer: Observer<MetricSample>,
}

/// Routes decoded events and lifecycle changes to registered observers.
#[derive(Default)]
pub struct EventDispatcher {
    samples: Mutex<Vec<SampleObserver>>,
    lifecycle: Mutex<Vec<Observer<LifecycleChange>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field(
                "sample_observers",
                &self.samples.lock().map(|list| list.len()).unwrap_or(0),
            )
            .field(
                "lifecycle_observers",
                &self.lifecycle.lock().map(|list| list.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for every recognised metric.
    pub fn on_sample<F>(&self, callback: F)
    where
        F: FnMut(MetricSample) + Send + 'static,
    {
        self.push_sample_observer(None, callback);
    }

    /// Registers an observer for a single metric kind.
    pub fn on_metric<F>(&self, kind: MetricKind, callback: F)
    where
        F: FnMut(MetricSample) + Send + 'static,
    {
        self.push_sample_observer(Some(kind), callback);
    }

    /// Registers an observer for connection state changes.
    ///
    /// Callbacks run on the Tokio runtime that delivers the first change.
    pub fn on_lifecycle_change<F>(&self, callback: F)
    where
        F: FnMut(LifecycleChange) + Send + 'static,
    {
        let observer = Observer::new(callback);
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Decodes an event frame and delivers the sample to matching observers.
    ///
    /// Unknown event types and unreadable payloads are logged and dropped.
    pub fn dispatch(&self, event: &EventFrame) -> Option<MetricSample> {
        let Some(kind) = MetricKind::from_tag(&event.event_type) else {
            debug!(
                event = "unknown_event_type_dropped",
                event_type = %event.event_type,
                seq = ?event.seq
            );
            return None;
        };

        let value = match event.reading() {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    event = "event_payload_dropped",
                    event_type = %event.event_type,
                    error = %err
                );
                return None;
            }
        };

        let sample = MetricSample {
            kind,
            value,
            seq: event.seq,
            received_at: Instant::now(),
        };

        let mut observers = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|entry| {
            if entry.filter.is_some_and(|filter| filter != kind) {
                return true;
            }
            entry.observer.deliver(sample.clone())
        });
        Some(sample)
    }

    /// Notifies lifecycle observers in registration order.
    pub fn lifecycle_changed(&self, change: LifecycleChange) {
        let mut observers = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|observer| observer.deliver(change.clone()));
    }

    fn push_sample_observer<F>(&self, filter: Option<MetricKind>, callback: F)
    where
        F: FnMut(MetricSample) + Send + 'static,
    {
        let observer = Observer::new(callback);
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SampleObserver { filter, observer });
    }
}
