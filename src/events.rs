//! Event Bus
//!
//! Typed publish/subscribe used to decouple the replication components.
//! Handlers subscribe per [`EventKind`]; publishers choose per call whether
//! handlers run on the caller's thread or are queued for the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::router::Topology;
use crate::trlog::{Position, TrLogEntry};

/// Request for the remote top position of a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrlogSync {
    pub trlog: Uuid,
    pub from: Uuid,
    pub to: Uuid,
}

/// Reply carrying the sender's top position of a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrlogState {
    pub trlog: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub top: Position,
}

/// One transfer batch of log entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrlogData {
    pub trlog: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub entries: Vec<TrLogEntry>,
}

/// Events exchanged between components
#[derive(Debug, Clone)]
pub enum Event {
    /// New cluster topology snapshot
    Topology(Arc<Topology>),
    /// A local transaction log gained entries
    TrlogChanged { trlog: Uuid },
    TrlogSync(TrlogSync),
    TrlogState(TrlogState),
    TrlogData(TrlogData),
}

/// Discriminant used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Topology,
    TrlogChanged,
    TrlogSync,
    TrlogState,
    TrlogData,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Topology(_) => EventKind::Topology,
            Event::TrlogChanged { .. } => EventKind::TrlogChanged,
            Event::TrlogSync(_) => EventKind::TrlogSync,
            Event::TrlogState(_) => EventKind::TrlogState,
            Event::TrlogData(_) => EventKind::TrlogData,
        }
    }

    /// Destination node of a peer-to-peer event
    pub fn destination(&self) -> Option<Uuid> {
        match self {
            Event::TrlogSync(m) => Some(m.to),
            Event::TrlogState(m) => Some(m.to),
            Event::TrlogData(m) => Some(m.to),
            Event::Topology(_) | Event::TrlogChanged { .. } => None,
        }
    }

    /// Originating node of a peer-to-peer event
    pub fn origin(&self) -> Option<Uuid> {
        match self {
            Event::TrlogSync(m) => Some(m.from),
            Event::TrlogState(m) => Some(m.from),
            Event::TrlogData(m) => Some(m.from),
            Event::Topology(_) | Event::TrlogChanged { .. } => None,
        }
    }
}

/// How a published event reaches its handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Call every handler on the publishing thread
    Immediate,
    /// Enqueue for the dispatcher task
    Queued,
}

/// Receiver of bus events
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event) -> Result<()>;
}

type HandlerMap = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

/// Typed event bus
pub struct EventBus {
    /// Registered handlers, shared with the dispatcher
    handlers: Arc<RwLock<HandlerMap>>,
    /// Queue for deferred delivery
    queue: mpsc::UnboundedSender<Event>,
    /// Queue receiver, taken by the dispatcher on start
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
    /// Set once the bus is closed
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus. Queued events accumulate until [`EventBus::start`].
    pub fn new() -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            queue,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler for one kind of event
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Number of handlers registered for a kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    /// Publish an event.
    ///
    /// With [`Delivery::Immediate`] every handler runs before this returns
    /// and the first handler error is returned.
    pub fn publish(&self, event: Event, delivery: Delivery) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        match delivery {
            Delivery::Immediate => dispatch(&self.handlers, &event),
            Delivery::Queued => self.queue.send(event).map_err(|_| Error::ShuttingDown),
        }
    }

    /// Start the dispatcher task for queued events
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Internal("event dispatcher already started".into()))?;

        let handlers = Arc::clone(&self.handlers);
        let mut shutdown_rx = self.shutdown.subscribe();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(e) = dispatch(&handlers, &event) {
                                    tracing::warn!("Queued {:?} event handler failed: {}", event.kind(), e);
                                }
                            }
                            None => break,
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Event dispatcher stopped");
        }))
    }

    /// Stop delivery and release every handler
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether the bus has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn dispatch(handlers: &RwLock<HandlerMap>, event: &Event) -> Result<()> {
    // snapshot so handlers may publish or subscribe re-entrantly
    let targets: Vec<Arc<dyn EventHandler>> = {
        let handlers = handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&event.kind()).cloned().unwrap_or_default()
    };

    let mut first_err = None;
    for handler in targets {
        if let Err(e) = handler.on_event(event) {
            match first_err {
                None => first_err = Some(e),
                Some(_) => tracing::debug!("Additional {:?} handler failure: {}", event.kind(), e),
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<Uuid>>,
    }

    impl EventHandler for Recorder {
        fn on_event(&self, event: &Event) -> Result<()> {
            if let Event::TrlogChanged { trlog } = event {
                self.seen.lock().unwrap().push(*trlog);
            }
            Ok(())
        }
    }

    struct Failing(AtomicUsize);

    impl EventHandler for Failing {
        fn on_event(&self, event: &Event) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::PeerUnreachable(event.destination().unwrap_or_default()))
        }
    }

    #[test]
    fn test_immediate_delivery() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        bus.subscribe(EventKind::TrlogChanged, recorder.clone());

        let id = Uuid::new_v4();
        bus.publish(Event::TrlogChanged { trlog: id }, Delivery::Immediate).unwrap();
        bus.publish(
            Event::TrlogSync(TrlogSync { trlog: id, from: id, to: id }),
            Delivery::Immediate,
        )
        .unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![id]);
    }

    #[test]
    fn test_immediate_reports_first_error_after_all_handlers() {
        let bus = EventBus::new();
        let first = Arc::new(Failing(AtomicUsize::new(0)));
        let second = Arc::new(Failing(AtomicUsize::new(0)));
        bus.subscribe(EventKind::TrlogSync, first.clone());
        bus.subscribe(EventKind::TrlogSync, second.clone());

        let peer = Uuid::new_v4();
        let result = bus.publish(
            Event::TrlogSync(TrlogSync { trlog: Uuid::new_v4(), from: Uuid::new_v4(), to: peer }),
            Delivery::Immediate,
        );

        assert!(matches!(result, Err(Error::PeerUnreachable(p)) if p == peer));
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_delivery_preserves_order() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        bus.subscribe(EventKind::TrlogChanged, recorder.clone());

        let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            bus.publish(Event::TrlogChanged { trlog: *id }, Delivery::Queued).unwrap();
        }
        // nothing delivered before the dispatcher runs
        assert!(recorder.seen.lock().unwrap().is_empty());

        let dispatcher = bus.start().unwrap();
        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), ids);

        assert!(bus.start().is_err());

        bus.close();
        dispatcher.await.unwrap();
        assert!(matches!(
            bus.publish(Event::TrlogChanged { trlog: ids[0] }, Delivery::Queued),
            Err(Error::ShuttingDown)
        ));
        assert_eq!(bus.handler_count(EventKind::TrlogChanged), 0);
    }
}
