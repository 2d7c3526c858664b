use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use shared::protocol::{DecodeError, EventKind, InboundEvent};
use tracing::{debug, warn};

use crate::error::TransportError;

pub type EventHandler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(EventKind),
    NoHandler(EventKind),
    Dropped,
}

/// Routes decoded inbound frames to one handler slot per event kind.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<HashMap<EventKind, EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler))
            .is_some();
        if replaced {
            debug!(kind = kind.as_str(), "ws: replaced event handler");
        }
    }

    pub fn off(&self, kind: EventKind) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    pub fn dispatch(&self, text: &str) -> DispatchOutcome {
        let event = match InboundEvent::decode(text) {
            Ok(event) => event,
            Err(DecodeError::UnknownKind(kind)) => {
                debug!(%kind, "ws: dropping frame of unknown type");
                return DispatchOutcome::Dropped;
            }
            Err(err) => {
                let err = TransportError::from(err);
                warn!(error = %err, "ws: dropping malformed frame");
                return DispatchOutcome::Dropped;
            }
        };

        let kind = event.kind();
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        match handler {
            // Lock already released; handlers may call on/off.
            Some(handler) => {
                debug!(kind = kind.as_str(), "ws: dispatching frame");
                handler(event);
                DispatchOutcome::Delivered(kind)
            }
            None => DispatchOutcome::NoHandler(kind),
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
