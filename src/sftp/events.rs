//! Connection lifecycle events
//!
//! A connection reports `end`, `close` and `error` through its [`EventHub`].
//! Listeners are registered per event kind and identified by a
//! [`ListenerId`] so that exactly the listeners a caller attached can be
//! detached again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::SftpError;
use crate::ssh::SshError;

/// Event raised by a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The remote side ended the channel
    End,
    /// The underlying transport closed
    Close,
    /// The transport reported an error
    Error(SshError),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::End => EventKind::End,
            ConnectionEvent::Close => EventKind::Close,
            ConnectionEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    End,
    Close,
    Error,
}

/// Handle for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A listener either consumes the event or raises a formatted error when it
/// has no pending operation to hand the failure to.
pub type Listener = Arc<dyn Fn(&ConnectionEvent) -> Result<(), SftpError> + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

/// Listener registry owned by one connection
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Registration { id, kind, listener });
        id
    }

    /// Detach a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.listeners.lock().iter().any(|r| r.id == id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    ///
    /// Errors raised by listeners are logged and returned to the emitter.
    pub fn emit(&self, event: ConnectionEvent) -> Vec<SftpError> {
        let kind = event.kind();
        // Listeners may attach or detach while handling, so call them unlocked
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.listener.clone())
            .collect();
        debug!("Emitting {:?} to {} listener(s)", kind, targets.len());

        let mut raised = Vec::new();
        for listener in targets {
            if let Err(e) = listener(&event) {
                warn!("Unhandled connection event: {}", e);
                raised.push(e);
            }
        }
        raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::error::fmt_error;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_off_and_counts() {
        let hub = EventHub::new();
        let noop: Listener = Arc::new(|_| Ok(()));

        let a = hub.on(EventKind::End, noop.clone());
        let b = hub.on(EventKind::End, noop.clone());
        let c = hub.on(EventKind::Error, noop);
        assert_eq!(hub.listener_count(EventKind::End), 2);
        assert_eq!(hub.listener_count(EventKind::Error), 1);
        assert_eq!(hub.listener_count(EventKind::Close), 0);

        assert!(hub.off(a));
        assert!(!hub.off(a));
        assert!(hub.is_registered(b));
        assert!(hub.off(c));
        assert_eq!(hub.listener_count(EventKind::End), 1);
        assert_eq!(hub.listener_count(EventKind::Error), 0);
    }

    #[test]
    fn test_emit_routes_by_kind_and_collects_raised_errors() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        hub.on(
            EventKind::Close,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        hub.on(
            EventKind::Close,
            Arc::new(|_| Err(fmt_error("closed", "test", None, None))),
        );

        assert!(hub.emit(ConnectionEvent::End).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let raised = hub.emit(ConnectionEvent::Close);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].message, "test: closed");
    }

    #[test]
    fn test_listener_may_detach_itself() {
        let hub = Arc::new(EventHub::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let hub_ref = hub.clone();
        let slot_ref = slot.clone();
        let id = hub.on(
            EventKind::End,
            Arc::new(move |_| {
                if let Some(id) = *slot_ref.lock() {
                    hub_ref.off(id);
                }
                Ok(())
            }),
        );
        *slot.lock() = Some(id);

        hub.emit(ConnectionEvent::End);
        assert_eq!(hub.listener_count(EventKind::End), 0);
    }
}
