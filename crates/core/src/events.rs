//! Generator events
//!
//! Events go to channel subscribers and to callback listeners. Callers
//! emit with no other lock held; the bus only locks its own lists long
//! enough to clone them.

use std::sync::{Arc, Mutex};

use readium_render::{Bitmap, TargetSize};

use crate::lock;

/// Something the generator wants consumers to know.
#[derive(Debug, Clone)]
pub enum GeneratorEvent {
    /// A thumbnail finished rendering at the requested size and quality
    ThumbnailGenerated {
        page: usize,
        size: TargetSize,
        quality: f64,
        bitmap: Arc<Bitmap>,
    },

    /// A request was rejected or failed for good
    ThumbnailError { page: usize, message: String },

    /// Pending work for the page was dropped before it produced a result
    ThumbnailCancelled { page: usize },

    /// Number of queued requests
    QueueSizeChanged(usize),

    /// Number of jobs in flight
    ActiveJobsChanged(usize),

    /// Successful renders out of all finished attempts
    GenerationProgress { completed: u64, total: u64 },
}

impl GeneratorEvent {
    /// Page the event is about, if any.
    pub fn page(&self) -> Option<usize> {
        match self {
            GeneratorEvent::ThumbnailGenerated { page, .. }
            | GeneratorEvent::ThumbnailError { page, .. }
            | GeneratorEvent::ThumbnailCancelled { page } => Some(*page),
            _ => None,
        }
    }
}

type Listener = Arc<dyn Fn(&GeneratorEvent) + Send + Sync>;

/// Fan-out of generator events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<flume::Sender<GeneratorEvent>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// New unbounded channel receiving every event emitted from now on.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> flume::Receiver<GeneratorEvent> {
        let (tx, rx) = flume::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Register a callback run on the emitting thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&GeneratorEvent) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn emit(&self, event: GeneratorEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in &listeners {
            listener(&event);
        }

        let subscribers = lock(&self.subscribers).clone();
        let mut disconnected = false;
        for subscriber in &subscribers {
            if subscriber.send(event.clone()).is_err() {
                disconnected = true;
            }
        }
        if disconnected {
            lock(&self.subscribers).retain(|subscriber| !subscriber.is_disconnected());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.emit(GeneratorEvent::QueueSizeChanged(3));

        assert!(matches!(first.try_recv(), Ok(GeneratorEvent::QueueSizeChanged(3))));
        assert!(matches!(second.try_recv(), Ok(GeneratorEvent::QueueSizeChanged(3))));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(GeneratorEvent::ActiveJobsChanged(1));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn test_listeners_called() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        bus.add_listener(move |event| {
            if matches!(event, GeneratorEvent::ThumbnailError { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(GeneratorEvent::ThumbnailError {
            page: 2,
            message: "broken".to_string(),
        });
        bus.emit(GeneratorEvent::QueueSizeChanged(0));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_page() {
        let event = GeneratorEvent::ThumbnailGenerated {
            page: 4,
            size: TargetSize::new(1, 1),
            quality: 1.0,
            bitmap: Arc::new(Bitmap::new(1, 1)),
        };
        assert_eq!(event.page(), Some(4));
        assert_eq!(GeneratorEvent::ThumbnailCancelled { page: 2 }.page(), Some(2));
        assert_eq!(GeneratorEvent::QueueSizeChanged(1).page(), None);
    }
}
