use super::{EventEmitter, ExecutionEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};

/// Receives every event published on the bus it is registered with.
///
/// Called from a dedicated task per handler, never from the engine's own
/// tasks. Must not panic; a panic is caught and logged.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Process-local event fan-out.
///
/// Stream consumers call `subscribe`. Registered handlers each get their
/// own bounded queue; a slow handler loses its oldest events, never the
/// publisher's time.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
    handlers: Mutex<Vec<Arc<HandlerSlot>>>,
}

struct HandlerSlot {
    handler: Arc<dyn EventHandler>,
    sender: broadcast::Sender<ExecutionEvent>,
    // Receiver parked until a runtime is available to drain it.
    pending: Mutex<Option<broadcast::Receiver<ExecutionEvent>>>,
}

impl HandlerSlot {
    fn ensure_started(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if pending.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(receiver) = pending.take() {
            handle.spawn(drain(self.handler.clone(), receiver));
        }
    }
}

async fn drain(handler: Arc<dyn EventHandler>, mut receiver: broadcast::Receiver<ExecutionEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if catch_unwind(AssertUnwindSafe(|| handler.on_event(&event))).is_err() {
                    tracing::error!(kind = event.kind(), "Event handler panicked");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event handler lagging, dropped {} oldest events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                sender,
                capacity,
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.sender.subscribe()
    }

    /// Append-only. Events emitted before registration are not replayed.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let (sender, receiver) = broadcast::channel(self.inner.capacity);
        let slot = Arc::new(HandlerSlot {
            handler,
            sender,
            pending: Mutex::new(Some(receiver)),
        });
        slot.ensure_started();
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(slot);
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Never blocks. Handlers are invoked outside the registration lock.
    pub fn emit(&self, event: ExecutionEvent) {
        let slots: Vec<Arc<HandlerSlot>> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for slot in slots {
            slot.ensure_started();
            let _ = slot.sender.send(event.clone());
        }
        let _ = self.inner.sender.send(event);
    }

    pub fn create_emitter(
        &self,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> EventEmitter {
        EventEmitter::new(execution_id, workflow_id, node_id, self.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
