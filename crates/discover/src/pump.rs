//! Gossip event pump
//!
//! A single task consumes the gossip event channel in delivery order.
//! Membership events are awaited through the translator before the next
//! event is read; application events are handed to the dispatcher, which
//! spawns the handler. Errors never stop the pump; they go to a second task
//! that logs them.

use std::sync::Arc;

use proven_gossip::{GossipEvent, GossipEvents, UserEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::translator::{PeerTranslator, is_reserved};

/// Running pump and error drain tasks
pub struct EventPump {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
    errors_handle: JoinHandle<()>,
}

impl EventPump {
    /// Start consuming `events`
    pub fn spawn(
        events: GossipEvents,
        translator: Arc<PeerTranslator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let (errors_tx, errors_rx) = flume::unbounded::<Error>();

        let errors_handle = tokio::spawn(async move {
            while let Ok(e) = errors_rx.recv_async().await {
                error!("Cluster event error: {}", e);
            }
        });

        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let pump = Pump {
                translator,
                dispatcher,
                errors: errors_tx,
            };

            loop {
                tokio::select! {
                    _ = stopped.notified() => {
                        debug!("Event pump stopping");
                        break;
                    }
                    event = events.recv_async() => match event {
                        Ok(event) => pump.handle(event).await,
                        Err(_) => {
                            debug!("Gossip event channel closed");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop,
            handle,
            errors_handle,
        }
    }

    /// Stop the pump and wait for both tasks to finish
    pub async fn stop(self) {
        self.stop.notify_one();

        if let Err(e) = self.handle.await {
            warn!("Event pump ended abnormally: {}", e);
        }
        if let Err(e) = self.errors_handle.await {
            warn!("Event error drain ended abnormally: {}", e);
        }
    }
}

struct Pump {
    translator: Arc<PeerTranslator>,
    dispatcher: Arc<Dispatcher>,
    errors: flume::Sender<Error>,
}

impl Pump {
    async fn handle(&self, event: GossipEvent) {
        trace!("Gossip {} event", event.kind());
        match event {
            GossipEvent::MemberJoin(members) => {
                for member in members {
                    debug!("Member joined: {} at {}", member.name, member.addr);
                }
            }
            GossipEvent::MemberLeave(members) => {
                for member in members {
                    debug!("Member left: {} at {}", member.name, member.addr);
                }
            }
            GossipEvent::MemberFailed(members) => {
                for member in members {
                    info!("Member failed: {} at {}", member.name, member.addr);
                    if let Err(e) = self.translator.on_member_failed(&member).await {
                        self.report(e);
                    }
                }
            }
            GossipEvent::User(event) => self.handle_user(event).await,
        }
    }

    async fn handle_user(&self, event: UserEvent) {
        if is_reserved(&event.name) {
            debug!(
                "Membership event {} (ltime {}): {}",
                event.name,
                event.ltime,
                String::from_utf8_lossy(&event.payload)
            );
            if let Err(e) = self.translator.handle(&event).await {
                self.report(e);
            }
        }

        // Reserved events also reach a user handler registered under the same name
        self.dispatcher.dispatch(&event);
    }

    fn report(&self, error: Error) {
        // Unbounded; only fails once the drain task is gone
        if let Err(flume::SendError(error)) = self.errors.send(error) {
            error!("Cluster event error: {}", error);
        }
    }
}
