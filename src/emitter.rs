//! Typed event dispatch.
//!
//! One listener table per event kind, supporting two delivery modes over the
//! same registry:
//!   - **callbacks** — async closures awaited to completion, one event at a
//!     time per listener, so a listener never sees event N+1 before it has
//!     finished with event N;
//!   - **streams** — bounded channels drained by the consumer; `emit` awaits
//!     channel capacity, giving slow consumers real backpressure.
//!
//! A snapshot of the table is taken before each emission, so listeners
//! added or removed during dispatch take effect from the next event.
//! Callback failures are collected and returned to the caller; they never
//! disturb other listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::event::BoxError;

/// Identifies a registered listener within one [`ListenerSet`].
pub type ListenerId = u64;

/// An owned one-shot closure that removes a registration when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Bounded queue depth for stream-mode listeners.
const STREAM_CAPACITY: usize = 16;

type Callback<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// A callback failure from one listener during an emission.
pub struct ListenerError {
    pub id: ListenerId,
    pub error: BoxError,
}

enum Delivery<T> {
    Callback(Callback<T>),
    Channel(mpsc::Sender<Arc<T>>),
}

impl<T> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(cb) => Self::Callback(Arc::clone(cb)),
            Self::Channel(tx) => Self::Channel(tx.clone()),
        }
    }
}

struct Entry<T> {
    id: ListenerId,
    delivery: Delivery<T>,
    /// `true` for `once` registrations, removed after one delivery.
    single: bool,
}

/// An async sequence of events, one per emission, in emission order.
pub type EventStream<T> = ReceiverStream<Arc<T>>;

// ============================================================================
// ListenerSet
// ============================================================================

/// Listener registry for a single event kind.
pub struct ListenerSet<T> {
    listeners: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
}

impl<T: Send + Sync + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an async callback for every event.
    pub fn on<F, Fut>(&self, callback: F) -> ListenerId
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.register(make_callback(callback), false)
    }

    /// Register an async callback delivered exactly one event.
    pub fn once<F, Fut>(&self, callback: F) -> ListenerId
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.register(make_callback(callback), true)
    }

    /// Register a stream-mode listener.
    ///
    /// With `single`, the stream yields one event and the registration is
    /// dropped. Dropping the stream unregisters on the next emission.
    pub fn stream(&self, single: bool) -> EventStream<T> {
        let capacity = if single { 1 } else { STREAM_CAPACITY };
        let (tx, rx) = mpsc::channel(capacity);
        self.register(Delivery::Channel(tx), single);
        ReceiverStream::new(rx)
    }

    /// Remove a listener. Safe to call for an id that is already gone.
    pub fn off(&self, id: ListenerId) {
        self.listeners.lock().retain(|entry| entry.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    fn register(&self, delivery: Delivery<T>, single: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Entry {
            id,
            delivery,
            single,
        });
        id
    }

    /// Deliver `event` to every registered listener, in registration order.
    ///
    /// Each callback is awaited before the next listener is tried; the lock
    /// is never held across an await. Returns the callback failures so the
    /// caller can record them.
    pub async fn emit(&self, event: Arc<T>) -> Vec<ListenerError> {
        let snapshot: Vec<(ListenerId, Delivery<T>, bool)> = {
            let guard = self.listeners.lock();
            guard
                .iter()
                .map(|e| (e.id, e.delivery.clone(), e.single))
                .collect()
        };

        let mut errors = Vec::new();
        let mut spent = Vec::new();

        for (id, delivery, single) in snapshot {
            let delivered = match delivery {
                Delivery::Callback(cb) => {
                    if let Err(error) = cb(Arc::clone(&event)).await {
                        errors.push(ListenerError { id, error });
                    }
                    true
                }
                // A closed channel means the consumer is gone.
                Delivery::Channel(tx) => tx.send(Arc::clone(&event)).await.is_ok(),
            };

            if single || !delivered {
                spent.push(id);
            }
        }

        if !spent.is_empty() {
            self.listeners
                .lock()
                .retain(|entry| !spent.contains(&entry.id));
        }

        errors
    }
}

impl<T: Send + Sync + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn make_callback<T, F, Fut>(callback: F) -> Delivery<T>
where
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Delivery::Callback(Arc::new(move |event| Box::pin(callback(event))))
}
