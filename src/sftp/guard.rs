//! Connection fault guard
//!
//! Every public operation runs inside [`guarded`]: a fresh [`OpState`] is
//! created, one `end`/`close`/`error` listener each is attached to the
//! connection's [`EventHub`] for the duration of the call, and the first
//! unexpected event turns into the operation's single error. The listeners
//! are owned by a [`ListenerScope`] and detached exactly once when it drops,
//! whichever way the operation exits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::{fmt_error, ErrorCode, SftpError};
use super::events::{ConnectionEvent, EventHub, EventKind, Listener, ListenerId};
use super::session::Session;

/// Termination flags for one guarded operation
#[derive(Debug, Default)]
pub struct OpState {
    error_handled: AtomicBool,
    end_called: AtomicBool,
    end_handled: AtomicBool,
    close_handled: AtomicBool,
}

impl OpState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// State for an operation that shuts the connection down itself, so its
    /// own end/close events are expected
    pub fn ending() -> Arc<Self> {
        let state = Self::default();
        state.end_called.store(true, Ordering::SeqCst);
        Arc::new(state)
    }

    pub fn error_handled(&self) -> bool {
        self.error_handled.load(Ordering::SeqCst)
    }

    pub fn end_called(&self) -> bool {
        self.end_called.load(Ordering::SeqCst)
    }

    pub fn end_handled(&self) -> bool {
        self.end_handled.load(Ordering::SeqCst)
    }

    pub fn close_handled(&self) -> bool {
        self.close_handled.load(Ordering::SeqCst)
    }

    pub fn mark_end_called(&self) {
        self.end_called.store(true, Ordering::SeqCst);
    }
}

/// One-shot continuation that fails the pending operation
#[derive(Clone)]
pub struct Reject {
    tx: Arc<Mutex<Option<oneshot::Sender<SftpError>>>>,
}

impl Reject {
    pub fn channel() -> (Self, oneshot::Receiver<SftpError>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver `err` to the pending operation. Only the first call delivers.
    pub fn reject(&self, err: SftpError) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(err).is_ok(),
            None => false,
        }
    }
}

fn surface(err: SftpError, reject: Option<&Reject>) -> Result<(), SftpError> {
    match reject {
        Some(r) => {
            if !r.reject(err.clone()) {
                debug!("Operation already settled, dropping: {}", err);
            }
            Ok(())
        }
        None => Err(err),
    }
}

/// Handler for the connection's `error` event.
///
/// The first error of the operation is surfaced; later ones are no-ops.
pub fn error_listener(state: Arc<OpState>, name: &str, reject: Option<Reject>) -> Listener {
    let name = name.to_string();
    Arc::new(move |event| {
        let ConnectionEvent::Error(source) = event else {
            return Ok(());
        };
        if state.error_handled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        surface(fmt_error(source, &name, None, None), reject.as_ref())
    })
}

/// Handler for the connection's `end` event.
///
/// An end that follows an error, a previous end, or a requested shutdown is
/// expected; any other end is an unexpected termination.
pub fn end_listener(state: Arc<OpState>, name: &str, reject: Option<Reject>) -> Listener {
    let name = name.to_string();
    Arc::new(move |event| {
        if !matches!(event, ConnectionEvent::End) {
            return Ok(());
        }
        if state.error_handled() || state.end_called() {
            return Ok(());
        }
        if state.end_handled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        surface(
            fmt_error(
                "Unexpected end event raised by remote",
                &name,
                Some(ErrorCode::UnexpectedTermination),
                None,
            ),
            reject.as_ref(),
        )
    })
}

/// Handler for the connection's `close` event.
///
/// Suppressed when the close follows an error or an end that was already
/// reported, or a requested shutdown.
pub fn close_listener(state: Arc<OpState>, name: &str, reject: Option<Reject>) -> Listener {
    let name = name.to_string();
    Arc::new(move |event| {
        if !matches!(event, ConnectionEvent::Close) {
            return Ok(());
        }
        if state.error_handled() || state.end_called() || state.end_handled() {
            return Ok(());
        }
        if state.close_handled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        surface(
            fmt_error(
                "Unexpected close event raised by remote",
                &name,
                Some(ErrorCode::UnexpectedTermination),
                None,
            ),
            reject.as_ref(),
        )
    })
}

/// The three listeners attached for one guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempListenerSet {
    pub end: ListenerId,
    pub close: ListenerId,
    pub error: ListenerId,
}

/// Attach one end, close and error listener for operation `name`
pub fn add_temp_listeners(
    hub: &EventHub,
    state: Arc<OpState>,
    name: &str,
    reject: Option<Reject>,
) -> TempListenerSet {
    debug!("{}: adding temp listeners", name);
    TempListenerSet {
        end: hub.on(EventKind::End, end_listener(state.clone(), name, reject.clone())),
        close: hub.on(
            EventKind::Close,
            close_listener(state.clone(), name, reject.clone()),
        ),
        error: hub.on(EventKind::Error, error_listener(state, name, reject)),
    }
}

/// Detach exactly the listeners in `set`.
///
/// Fails when there is no set, or when any of its listeners is no longer
/// attached (a second removal of the same set).
pub fn remove_temp_listeners(
    hub: &EventHub,
    set: Option<&TempListenerSet>,
    name: &str,
) -> Result<(), SftpError> {
    let Some(set) = set else {
        return Err(fmt_error(
            "Cannot remove temporary listeners: no listener set supplied",
            name,
            Some(ErrorCode::GenericClient),
            None,
        ));
    };
    debug!("{}: removing temp listeners", name);
    let removed = [set.end, set.close, set.error]
        .into_iter()
        .filter(|id| hub.off(*id))
        .count();
    if removed == 3 {
        Ok(())
    } else {
        Err(fmt_error(
            format!(
                "Temporary listener set is malformed or already removed ({} of 3 attached)",
                removed
            ),
            name,
            Some(ErrorCode::GenericClient),
            None,
        ))
    }
}

/// Scoped ownership of a [`TempListenerSet`]; detaches it on drop
pub struct ListenerScope {
    hub: Arc<EventHub>,
    set: Option<TempListenerSet>,
    name: String,
}

impl ListenerScope {
    pub fn attach(
        hub: Arc<EventHub>,
        state: Arc<OpState>,
        name: &str,
        reject: Option<Reject>,
    ) -> Self {
        let set = add_temp_listeners(&hub, state, name, reject);
        Self {
            hub,
            set: Some(set),
            name: name.to_string(),
        }
    }

    pub fn listeners(&self) -> Option<&TempListenerSet> {
        self.set.as_ref()
    }

    /// Detach now and report the outcome instead of logging it
    pub fn release(mut self) -> Result<(), SftpError> {
        let set = self.set.take();
        remove_temp_listeners(&self.hub, set.as_ref(), &self.name)
    }
}

impl Drop for ListenerScope {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            if let Err(e) = remove_temp_listeners(&self.hub, Some(&set), &self.name) {
                warn!("{}", e);
            }
        }
    }
}

/// Precondition guard: is there an open session?
///
/// Returns `Ok(true)` when there is. Otherwise the "No connection" failure is
/// handed to `reject` (returning `Ok(false)`) or returned as the error.
pub fn have_connection(
    session: Option<&Session>,
    name: &str,
    reject: Option<&Reject>,
) -> Result<bool, SftpError> {
    if session.is_some_and(|s| s.is_open()) {
        return Ok(true);
    }
    let err = SftpError::no_connection(name);
    match reject {
        Some(r) => {
            r.reject(err);
            Ok(false)
        }
        None => Err(err),
    }
}

/// Run `op` with temporary listeners attached to `hub`.
///
/// An unexpected end/close or a connection error observed while `op` is in
/// flight becomes the result; otherwise `op`'s own result is returned.
pub async fn guarded<T, F>(
    hub: &Arc<EventHub>,
    name: &str,
    state: Arc<OpState>,
    op: F,
) -> Result<T, SftpError>
where
    F: Future<Output = Result<T, SftpError>>,
{
    let (reject, rejected) = Reject::channel();
    let _scope = ListenerScope::attach(hub.clone(), state, name, Some(reject));
    tokio::select! {
        biased;
        Ok(err) = rejected => Err(err),
        res = op => res,
    }
}
