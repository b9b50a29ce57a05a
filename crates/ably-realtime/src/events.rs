//! In-process observer hub.
//!
//! Handlers run in registration order on the emitting task. Delivery works on
//! a snapshot of the listener list, so handlers may register or remove
//! listeners (including themselves) while an event is being delivered.
//! A panicking handler is logged and counted; later handlers still run.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Registration handle returned by [`EventEmitter::on`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<E> {
    id: ListenerId,
    handler: Handler<E>,
    predicate: Option<Predicate<E>>,
    once: bool,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            predicate: self.predicate.clone(),
            once: self.once,
        }
    }
}

pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
    faults: AtomicU64,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .field("faults", &self.fault_count())
            .finish()
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            faults: AtomicU64::new(0),
        }
    }

    /// Invoke `handler` for every event until [`off`](Self::off).
    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), None, false)
    }

    /// Invoke `handler` for the next event only.
    pub fn once<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), None, true)
    }

    /// Invoke `handler` for every event accepted by `predicate`.
    pub fn on_matching<P, F>(&self, predicate: P, handler: F) -> ListenerId
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), Some(Arc::new(predicate)), false)
    }

    /// Invoke `handler` for the next event accepted by `predicate`.
    pub fn once_matching<P, F>(&self, predicate: P, handler: F) -> ListenerId
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), Some(Arc::new(predicate)), true)
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn off_all(&self) {
        self.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of handler panics caught so far.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every matching listener. Returns how many handlers
    /// ran to completion.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = self.lock().clone();
        let mut delivered = 0;

        for listener in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let matched = listener.predicate.as_ref().is_none_or(|p| p(event));
                // A once-listener fires only if this emit is the one that
                // removes it; concurrent emits or `off` may have beaten us.
                if matched && (!listener.once || self.off(listener.id)) {
                    (listener.handler)(event);
                    true
                } else {
                    false
                }
            }));
            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(payload) => {
                    let faults = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::error!(
                        listener = listener.id.0,
                        faults,
                        panic = panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        delivered
    }

    fn register(
        &self,
        handler: Handler<E>,
        predicate: Option<Predicate<E>>,
        once: bool,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Listener {
            id,
            handler,
            predicate,
            once,
        });
        id
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Listener<E>>> {
        // Handlers never run under this lock, so poisoning can only come from
        // a panic inside Vec operations; the list is still consistent.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
