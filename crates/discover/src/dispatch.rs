//! Custom event dispatch
//!
//! Application events are routed by name to registered handlers. Every
//! invocation runs on its own tokio task, so a slow handler never holds up
//! the event pump and no ordering among invocations is implied.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use proven_gossip::UserEvent;
use tracing::{trace, warn};

/// Error returned by an event handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Async handler for a named event
pub type EventHandlerFn =
    Arc<dyn Fn(CustomEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Handlers keyed by event name
pub type HandlerMap = HashMap<String, EventHandlerFn>;

/// Receives handler failures
pub type HandlerErrorSink = flume::Sender<HandlerFailure>;

/// Wrap an async closure as an [`EventHandlerFn`]
pub fn handler<F, Fut>(f: F) -> EventHandlerFn
where
    F: Fn(CustomEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// An application event as handed to a handler
#[derive(Debug, Clone)]
pub struct CustomEvent {
    /// Event name
    pub name: String,
    /// Opaque payload
    pub payload: Bytes,
    /// Lamport time assigned by gossip
    pub ltime: u64,
    /// When this node received the event
    pub received_at: DateTime<Utc>,
}

impl From<&UserEvent> for CustomEvent {
    fn from(event: &UserEvent) -> Self {
        Self {
            name: event.name.clone(),
            payload: event.payload.clone(),
            ltime: event.ltime,
            received_at: Utc::now(),
        }
    }
}

/// A handler invocation that returned an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Event name
    pub event: String,
    /// Rendered handler error
    pub error: String,
}

#[derive(Default)]
struct HandlerRegistry {
    handlers: HandlerMap,
    sink: Option<HandlerErrorSink>,
}

/// Name-to-handler routing for application events
pub struct Dispatcher {
    registry: ArcSwap<HandlerRegistry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no handlers
    pub fn new() -> Self {
        Self {
            registry: ArcSwap::from_pointee(HandlerRegistry::default()),
        }
    }

    /// Replace the handler map and error sink
    pub fn register(&self, handlers: HandlerMap, sink: Option<HandlerErrorSink>) {
        self.registry
            .store(Arc::new(HandlerRegistry { handlers, sink }));
    }

    /// Whether a handler is registered for `name`
    pub fn has_handler(&self, name: &str) -> bool {
        self.registry.load().handlers.contains_key(name)
    }

    /// Spawn the handler for `event`, returning whether one was registered
    pub fn dispatch(&self, event: &UserEvent) -> bool {
        let registry = self.registry.load();
        let Some(handler) = registry.handlers.get(&event.name).cloned() else {
            trace!("No handler registered for event {}", event.name);
            return false;
        };
        let sink = registry.sink.clone();
        let custom = CustomEvent::from(event);

        tokio::spawn(async move {
            let name = custom.name.clone();
            if let Err(e) = handler(custom).await {
                let failure = HandlerFailure {
                    event: name,
                    error: e.to_string(),
                };
                match sink {
                    Some(sink) => {
                        if let Err(flume::SendError(failure)) = sink.send(failure) {
                            warn!(
                                "Handler for {} failed and the error sink is gone: {}",
                                failure.event, failure.error
                            );
                        }
                    }
                    None => warn!("Handler for {} failed: {}", failure.event, failure.error),
                }
            }
        });

        true
    }
}
