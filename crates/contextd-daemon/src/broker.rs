//! Broker coordinator task.
//!
//! One task owns the property store, derivation engine, subscription
//! registry, and the outbound queues, and consumes a command channel fed by
//! every connection task. All mutations are serialized here: each raw update
//! is applied together with its cascading rule recomputation and the
//! notification fan-out it produces, so a subscriber never observes a
//! derived property inconsistent with the raw inputs that produced it.
//!
//! Subscriber sessions and provider connections draw ids from one space, so
//! the outbox addresses both planes uniformly.

use std::collections::{HashMap, HashSet};

use contextd_core::config::BrokerConfig;
use contextd_core::registry::{SessionId, SubscriptionRegistry};
use contextd_core::rules::{build_rules, DerivationEngine};
use contextd_core::store::{ChangeEvent, PropertyStore, StoreError};
use contextd_core::value::ContextValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::command::{
    error_line, providers_reply, push_line, value_reply, ProviderCommand, SubscriberCommand,
};
use crate::protocol::outbox::{frame, SessionOutbox, SessionSender};

/// Depth of the broker command queue shared by all connection tasks.
pub const COMMAND_QUEUE_DEPTH: usize = 256;

const ANNOUNCE_FIRST: &str = "announce with \"provider <id>\" first";

/// One message from a connection task to the broker.
pub enum BrokerCommand {
    /// A subscriber session connected; its sink takes pushes and replies.
    SessionOpened {
        session: SessionId,
        sink: SessionSender,
    },
    /// A parsed command from a subscriber session.
    SessionRequest {
        session: SessionId,
        command: SubscriberCommand,
    },
    /// A subscriber session went away; drops all its subscriptions.
    SessionClosed { session: SessionId },
    /// A provider connected; its sink takes `error:` replies.
    ProviderOpened {
        conn: SessionId,
        sink: SessionSender,
    },
    /// A parsed command from a provider connection.
    ProviderRequest {
        conn: SessionId,
        command: ProviderCommand,
    },
    /// A provider went away, orderly or not; equivalent to `unset` of every
    /// key it owned.
    ProviderClosed { conn: SessionId },
}

/// Cloneable sending side of the broker command channel.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    /// Queues one command, waiting for channel capacity.
    ///
    /// A dropped broker task only happens during shutdown; the command is
    /// discarded then.
    pub async fn send(&self, command: BrokerCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("broker task gone; command dropped");
        }
    }
}

struct ProviderState {
    /// Announced identity; `None` until `provider <id>` arrives.
    id: Option<String>,
}

/// Single owner of all broker state.
pub struct Broker {
    store: PropertyStore,
    engine: DerivationEngine,
    registry: SubscriptionRegistry,
    outbox: SessionOutbox,
    providers: HashMap<SessionId, ProviderState>,
    /// Provider ids currently announced, to refuse identity aliasing.
    announced: HashSet<String>,
    rx: mpsc::Receiver<BrokerCommand>,
}

impl Broker {
    /// Builds the broker and installs the configured rules, computing their
    /// rest values before any connection is accepted.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotOwner`] when two rules claim the same output key;
    /// config validation normally rules that out.
    pub fn new(config: &BrokerConfig) -> Result<(Self, BrokerHandle), StoreError> {
        let mut store = PropertyStore::new();
        let mut engine = DerivationEngine::new(build_rules(&config.rules));
        let seeded = engine.install(&mut store)?;
        info!(
            rules = config.rules.len(),
            seeded = seeded.len(),
            "derivation rules installed"
        );

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let broker = Self {
            store,
            engine,
            registry: SubscriptionRegistry::new(),
            outbox: SessionOutbox::new(),
            providers: HashMap::new(),
            announced: HashSet::new(),
            rx,
        };
        Ok((broker, BrokerHandle { tx }))
    }

    /// Consumes commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        debug!("broker command channel drained; stopping");
    }

    /// Applies one command. Synchronous so the whole state machine is
    /// testable without a runtime.
    pub fn handle(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::SessionOpened { session, sink } => {
                debug!(session, "subscriber session opened");
                self.outbox.register(session, sink);
            },
            BrokerCommand::SessionRequest { session, command } => {
                self.handle_session(session, command);
            },
            BrokerCommand::SessionClosed { session } => {
                debug!(session, "subscriber session closed");
                self.registry.unsubscribe_all(session);
                self.outbox.unregister(session);
            },
            BrokerCommand::ProviderOpened { conn, sink } => {
                debug!(conn, "provider connection opened");
                self.outbox.register(conn, sink);
                self.providers.insert(conn, ProviderState { id: None });
            },
            BrokerCommand::ProviderRequest { conn, command } => {
                self.handle_provider(conn, command);
            },
            BrokerCommand::ProviderClosed { conn } => self.handle_provider_closed(conn),
        }
    }

    fn handle_session(&mut self, session: SessionId, command: SubscriberCommand) {
        match command {
            SubscriberCommand::Subscribe { key } => {
                self.registry.subscribe(session, &key);
                // a subscription always answers with the current value,
                // undefined included
                let payload = frame(&push_line(&key, self.store.value(&key)));
                self.outbox.send(session, payload);
            },
            SubscriberCommand::Unsubscribe { key } => {
                self.registry.unsubscribe(session, &key);
            },
            SubscriberCommand::Query { key } => {
                let payload = frame(&value_reply(self.store.value(&key)));
                self.outbox.send(session, payload);
            },
            SubscriberCommand::Providers { key } => {
                let payload = frame(&providers_reply(&key, self.store.owner(&key)));
                self.outbox.send(session, payload);
            },
        }
    }

    fn handle_provider(&mut self, conn: SessionId, command: ProviderCommand) {
        match command {
            ProviderCommand::Announce { id } => self.handle_announce(conn, id),
            ProviderCommand::Declare { key, value } => {
                let Some(id) = self.provider_id(conn) else {
                    self.report(conn, ANNOUNCE_FIRST);
                    return;
                };
                match self.store.set_raw(&key, &id, value) {
                    Ok(event) => self.apply_change(event),
                    Err(err) => {
                        debug!(provider = %id, key = %key, %err, "declare rejected");
                        self.report(conn, &err.to_string());
                    },
                }
            },
            ProviderCommand::Set { key, value } => self.handle_set(conn, key, value),
            ProviderCommand::Unset { key } => {
                let Some(id) = self.provider_id(conn) else {
                    self.report(conn, ANNOUNCE_FIRST);
                    return;
                };
                match self.store.unset(&key, &id) {
                    Ok(event) => self.apply_change(event),
                    Err(err) => self.report(conn, &err.to_string()),
                }
            },
        }
    }

    fn handle_announce(&mut self, conn: SessionId, id: String) {
        match self.providers.get(&conn) {
            None => {
                debug!(conn, "announce from unknown provider connection");
            },
            Some(ProviderState { id: Some(existing) }) => {
                let reason = format!("already announced as {existing:?}");
                self.report(conn, &reason);
            },
            Some(ProviderState { id: None }) => {
                if self.announced.contains(&id) {
                    self.report(conn, &format!("provider id {id:?} already in use"));
                    return;
                }
                info!(provider = %id, conn, "provider announced");
                self.announced.insert(id.clone());
                if let Some(state) = self.providers.get_mut(&conn) {
                    state.id = Some(id);
                }
            },
        }
    }

    fn handle_set(&mut self, conn: SessionId, key: String, value: String) {
        let Some(id) = self.provider_id(conn) else {
            self.report(conn, ANNOUNCE_FIRST);
            return;
        };
        // bare assignment never claims a key; only `add` declares
        if self.store.owner(&key) != Some(id.as_str()) {
            let err = StoreError::NotAProvider { key, provider: id };
            self.report(conn, &err.to_string());
            return;
        }
        let Some(key_type) = self.store.key_type(&key) else {
            self.report(conn, &format!("{key} has no declared type"));
            return;
        };
        match ContextValue::parse_typed(key_type, &value) {
            Ok(parsed) => match self.store.set_raw(&key, &id, parsed) {
                Ok(event) => self.apply_change(event),
                Err(err) => self.report(conn, &err.to_string()),
            },
            Err(err) => {
                debug!(provider = %id, key = %key, %err, "update rejected");
                self.report(conn, &err.to_string());
            },
        }
    }

    fn handle_provider_closed(&mut self, conn: SessionId) {
        self.outbox.unregister(conn);
        let Some(state) = self.providers.remove(&conn) else {
            return;
        };
        let Some(id) = state.id else {
            debug!(conn, "provider connection closed before announcing");
            return;
        };
        self.announced.remove(&id);
        let events = self.store.mark_provider_gone(&id);
        info!(provider = %id, conn, keys = events.len(), "provider gone; owned keys unset");
        for event in events {
            self.apply_change(event);
        }
    }

    /// Propagates one applied change through the rules, then notifies
    /// watchers of the raw change and every derived change, in order.
    fn apply_change(&mut self, event: ChangeEvent) {
        let cascades = self.engine.propagate(&event.key, &mut self.store);
        self.notify(&event);
        for cascade in &cascades {
            self.notify(cascade);
        }
    }

    /// Pushes one change to every watcher. Changes that left the value
    /// as-is are suppressed; the revision advanced regardless.
    fn notify(&self, event: &ChangeEvent) {
        if !event.value_changed {
            return;
        }
        let payload = frame(&push_line(&event.key, event.value.as_ref()));
        for session in self.registry.sessions_for(&event.key) {
            self.outbox.send(session, payload.clone());
        }
    }

    fn provider_id(&self, conn: SessionId) -> Option<String> {
        self.providers.get(&conn).and_then(|state| state.id.clone())
    }

    fn report(&self, conn: SessionId, reason: &str) {
        debug!(conn, reason, "command rejected");
        self.outbox.send(conn, frame(&error_line(reason)));
    }
}
