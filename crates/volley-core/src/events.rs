//! Stream event listeners
//!
//! Listeners are registered per event name and invoked in registration order.
//! A listener that fails or panics is logged and skipped for that emission only.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::runtime::panic_message;

pub const EVENT_DATA: &str = "data";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_END: &str = "end";

type Callback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// A script callback, or an inert value a script passed where a callback was expected
#[derive(Clone)]
pub struct Listener {
    callback: Option<Callback>,
}

impl Listener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(f)),
        }
    }

    /// Non-callable registration; ignored by the registry
    pub fn inert() -> Self {
        Self { callback: None }
    }

    pub fn is_callable(&self) -> bool {
        self.callback.is_some()
    }
}

impl From<Value> for Listener {
    fn from(_: Value) -> Self {
        Self::inert()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("callable", &self.is_callable())
            .finish()
    }
}

/// Event name to listeners, in registration order
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<HashMap<String, Vec<Callback>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`. Non-callable listeners are ignored.
    pub fn on(&self, event: &str, listener: Listener) {
        let Some(callback) = listener.callback else {
            tracing::debug!(event, "Ignoring non-callable listener");
            return;
        };
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Invoke every listener for `event` with `payload`.
    ///
    /// Must run on the loop thread. The listener list is snapshotted first so
    /// listeners may register more listeners.
    pub fn emit(&self, event: &str, payload: &Value) {
        let snapshot: Vec<Callback> = match self.listeners.read().get(event) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for (index, listener) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event, listener = index, error = %e, "Event listener failed");
                }
                Err(panic) => {
                    tracing::warn!(
                        event,
                        listener = index,
                        panic = %panic_message(&panic),
                        "Event listener panicked"
                    );
                }
            }
        }
    }
}
