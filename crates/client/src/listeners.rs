//! Application callbacks.
//!
//! Each event has a single slot; registering a callback replaces the previous
//! one. Callbacks are cloned out of their slot before being invoked so no
//! lock is held while application code runs.
//!
//! A panicking callback is contained here: it is logged and reported to the
//! error listener instead of unwinding into the connection's tasks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::error;

use crate::error::ClientError;

pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;
pub type WriteCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

type Slot<T> = Arc<Mutex<Option<T>>>;

fn load<T: Clone>(slot: &Slot<T>) -> Option<T> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
}

fn store<T>(slot: &Slot<T>, cb: T) {
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(cb);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    reconnect: Slot<ReconnectCallback>,
    disconnect: Slot<DisconnectCallback>,
    write: Slot<WriteCallback>,
    unsubscribed: Slot<NotifyCallback>,
    user_notify: Slot<NotifyCallback>,
    error: Slot<ErrorCallback>,
}

impl Listeners {
    pub(crate) fn set_reconnect(&self, cb: ReconnectCallback) {
        store(&self.reconnect, cb);
    }

    pub(crate) fn set_disconnect(&self, cb: DisconnectCallback) {
        store(&self.disconnect, cb);
    }

    pub(crate) fn set_write(&self, cb: WriteCallback) {
        store(&self.write, cb);
    }

    pub(crate) fn set_unsubscribed(&self, cb: NotifyCallback) {
        store(&self.unsubscribed, cb);
    }

    pub(crate) fn set_user_notify(&self, cb: NotifyCallback) {
        store(&self.user_notify, cb);
    }

    pub(crate) fn set_error(&self, cb: ErrorCallback) {
        store(&self.error, cb);
    }

    /// Runs one application callback, containing a panic.
    fn guarded(&self, listener: &'static str, call: impl FnOnce()) {
        let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) else {
            return;
        };
        let message = panic_message(payload.as_ref());
        error!(listener, %message, "listener panicked");
        self.error(&ClientError::Panicked {
            context: format!("{listener} listener"),
            message,
        });
    }

    pub(crate) fn reconnected(&self) {
        if let Some(cb) = load(&self.reconnect) {
            self.guarded("reconnect", || cb());
        }
    }

    pub(crate) fn disconnected(&self, code: u16, reason: &str) {
        if let Some(cb) = load(&self.disconnect) {
            self.guarded("disconnect", || cb(code, reason));
        }
    }

    pub(crate) fn write(&self, nodes: Vec<Value>) {
        if let Some(cb) = load(&self.write) {
            self.guarded("write", || cb(nodes));
        }
    }

    pub(crate) fn unsubscribed(&self, params: Value) {
        if let Some(cb) = load(&self.unsubscribed) {
            self.guarded("unsubscribed", || cb(params));
        }
    }

    pub(crate) fn user_notify(&self, params: Value) {
        if let Some(cb) = load(&self.user_notify) {
            self.guarded("user notify", || cb(params));
        }
    }

    pub(crate) fn error(&self, err: &ClientError) {
        let Some(cb) = load(&self.error) else {
            return;
        };
        // Nothing left to report a panicking error listener to.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(err))) {
            error!(message = %panic_message(payload.as_ref()), %err, "error listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registering_replaces_previous_callback() {
        let listeners = Listeners::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        listeners.set_reconnect(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        listeners.set_reconnect(Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.reconnected();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_slots_are_noops() {
        let listeners = Listeners::default();
        listeners.disconnected(1006, "gone");
        listeners.write(vec![]);
        listeners.error(&ClientError::Timeout);
    }

    #[test]
    fn panicking_listener_is_reported_to_error_listener() {
        let listeners = Listeners::default();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let r = reported.clone();
        listeners.set_error(Arc::new(move |e: &ClientError| {
            r.lock().unwrap().push(e.to_string());
        }));
        listeners.set_write(Arc::new(|_: Vec<Value>| panic!("app bug")));

        listeners.write(vec![Value::Null]);

        assert_eq!(
            *reported.lock().unwrap(),
            vec!["write listener panicked: app bug".to_string()]
        );
    }

    #[test]
    fn panicking_error_listener_is_contained() {
        let listeners = Listeners::default();
        listeners.set_error(Arc::new(|_: &ClientError| panic!("worse bug")));
        listeners.set_reconnect(Arc::new(|| panic!("app bug")));
        listeners.reconnected();
    }

    #[test]
    fn panic_message_reads_string_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn callback_may_reregister_itself() {
        let listeners = Listeners::default();
        let inner = listeners.clone();
        listeners.set_user_notify(Arc::new(move |_: Value| {
            inner.set_user_notify(Arc::new(|_: Value| {}));
        }));
        listeners.user_notify(Value::Null);
    }
}
