//! Bridging remote events to local callbacks.
//!
//! The target raises every event in one shape: event name, sender and
//! payload. Local callbacks come in three shapes, picked once when the
//! [`EventHandler`] is built:
//!
//! | constructor | called with |
//! |---|---|
//! | [`EventHandler::none`] | nothing |
//! | [`EventHandler::payload`] | the payload, cast to `P` |
//! | [`EventHandler::sender_payload`] | sender and payload, cast to `S` and `P` |
//!
//! [`EventHandler::dynamic`] covers name-driven callers that only know the
//! arity at runtime; arities other than 0, 1 and 2 are rejected at subscribe
//! time.
//!
//! Notifications for one subscription are delivered in channel order and
//! never concurrently. Different subscriptions are not serialized against
//! each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use remora_channel::EventSink;
use remora_protocol::{Notification, SubscriptionId, Value};

use crate::cast::Cast;
use crate::error::{Error, Result};
use crate::handle::RemoteHandle;
use crate::proxy::ObjectProxy;
use crate::session::{Session, WeakSession};

type Adapter = Box<dyn FnMut(&Session, Value, Value) -> Result<()> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Shape {
    None(Box<dyn FnMut() + Send>),
    Payload(Adapter),
    SenderPayload(Adapter),
    Dynamic {
        arity: usize,
        callback: Box<dyn FnMut(Vec<Value>) + Send>,
    },
}

/// A local callback for a remote event.
pub struct EventHandler {
    shape: Shape,
}

impl EventHandler {
    /// Ignore sender and payload.
    pub fn none<F>(callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            shape: Shape::None(Box::new(callback)),
        }
    }

    /// Receive the payload only.
    pub fn payload<P, F>(mut callback: F) -> Self
    where
        P: Cast + 'static,
        F: FnMut(P) + Send + 'static,
    {
        Self {
            shape: Shape::Payload(Box::new(
                move |session: &Session, _sender: Value, payload: Value| -> Result<()> {
                    callback(P::cast(session, payload)?);
                    Ok(())
                },
            )),
        }
    }

    /// Receive sender and payload.
    pub fn sender_payload<S, P, F>(mut callback: F) -> Self
    where
        S: Cast + 'static,
        P: Cast + 'static,
        F: FnMut(S, P) + Send + 'static,
    {
        Self {
            shape: Shape::SenderPayload(Box::new(
                move |session: &Session, sender: Value, payload: Value| -> Result<()> {
                    let sender = S::cast(session, sender)?;
                    callback(sender, P::cast(session, payload)?);
                    Ok(())
                },
            )),
        }
    }

    /// A callback taking `arity` raw values: none, `[payload]`, or
    /// `[sender, payload]`.
    pub fn dynamic<F>(arity: usize, callback: F) -> Self
    where
        F: FnMut(Vec<Value>) + Send + 'static,
    {
        Self {
            shape: Shape::Dynamic {
                arity,
                callback: Box::new(callback),
            },
        }
    }

    /// Number of values the callback receives.
    pub fn arity(&self) -> usize {
        match &self.shape {
            Shape::None(_) => 0,
            Shape::Payload(_) => 1,
            Shape::SenderPayload(_) => 2,
            Shape::Dynamic { arity, .. } => *arity,
        }
    }

    fn into_adapter(self) -> Result<Adapter> {
        let adapter: Adapter = match self.shape {
            Shape::None(mut callback) => {
                Box::new(move |_: &Session, _: Value, _: Value| -> Result<()> {
                    callback();
                    Ok(())
                })
            }
            Shape::Payload(adapter) | Shape::SenderPayload(adapter) => adapter,
            Shape::Dynamic {
                arity: 0,
                mut callback,
            } => Box::new(move |_: &Session, _: Value, _: Value| -> Result<()> {
                callback(Vec::new());
                Ok(())
            }),
            Shape::Dynamic {
                arity: 1,
                mut callback,
            } => Box::new(move |_: &Session, _: Value, payload: Value| -> Result<()> {
                callback(vec![payload]);
                Ok(())
            }),
            Shape::Dynamic {
                arity: 2,
                mut callback,
            } => Box::new(
                move |_: &Session, sender: Value, payload: Value| -> Result<()> {
                    callback(vec![sender, payload]);
                    Ok(())
                },
            ),
            Shape::Dynamic { arity, .. } => {
                return Err(Error::Argument(format!(
                    "event callbacks take 0, 1 or 2 parameters, got {arity}"
                )))
            }
        };
        Ok(adapter)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("arity", &self.arity())
            .finish()
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies one subscription made through an [`EventBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

/// Delivery state of one subscription.
struct Slot {
    event: String,
    active: AtomicBool,
    deliver: Mutex<Adapter>,
    session: WeakSession,
}

impl Slot {
    fn deliver(&self, notification: Notification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let mut adapter = lock(&self.deliver);
        // Deactivated while waiting for the previous delivery.
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.is_disposed() {
            return;
        }
        if let Err(e) = (*adapter)(&session, notification.sender, notification.payload) {
            tracing::warn!("Dropping {} notification: {e}", self.event);
        }
    }
}

struct Registration {
    source: RemoteHandle,
    subscription: SubscriptionId,
    slot: Arc<Slot>,
}

/// Every live subscription of one session, keyed by token.
///
/// Closed on dispose; nothing can be registered afterwards.
pub(crate) struct Registry {
    entries: Mutex<Option<HashMap<SubscriptionToken, Registration>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Some(HashMap::new())),
        }
    }

    fn insert(&self, token: SubscriptionToken, registration: Registration) -> bool {
        match lock(&self.entries).as_mut() {
            Some(entries) => {
                entries.insert(token, registration);
                true
            }
            None => false,
        }
    }

    fn remove(&self, token: SubscriptionToken) -> Option<Registration> {
        lock(&self.entries).as_mut()?.remove(&token)
    }

    fn contains(&self, token: SubscriptionToken) -> bool {
        lock(&self.entries)
            .as_ref()
            .is_some_and(|entries| entries.contains_key(&token))
    }

    fn tokens_for(&self, source: &RemoteHandle) -> Vec<SubscriptionToken> {
        lock(&self.entries)
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, r)| &r.source == source)
                    .map(|(token, _)| *token)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deactivate every slot and refuse further registrations.
    pub(crate) fn close(&self) {
        let entries = lock(&self.entries).take().unwrap_or_default();
        for registration in entries.into_values() {
            registration.slot.active.store(false, Ordering::SeqCst);
        }
    }
}

/// Event subscriptions on one remote object.
///
/// Obtained from [`ObjectProxy::events`]. Registrations belong to the
/// session, so a token can be unsubscribed through any bridge of that
/// session, not only the one that issued it.
#[derive(Clone)]
pub struct EventBridge {
    source: ObjectProxy,
}

impl EventBridge {
    pub fn new(source: ObjectProxy) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &ObjectProxy {
        &self.source
    }

    /// Register `handler` for `event`.
    pub async fn subscribe(&self, event: &str, handler: EventHandler) -> Result<SubscriptionToken> {
        let adapter = handler.into_adapter()?;
        let session = self.source.session();
        let channel = session.channel_for(self.source.handle())?;
        self.source.capabilities().await?.check_event(event)?;

        let slot = Arc::new(Slot {
            event: event.to_string(),
            active: AtomicBool::new(true),
            deliver: Mutex::new(adapter),
            session: session.downgrade(),
        });
        let sink_slot = Arc::clone(&slot);
        let sink: EventSink =
            Arc::new(move |notification: Notification| sink_slot.deliver(notification));

        let subscription = session
            .call(event, channel.subscribe(self.source.id(), event, sink))
            .await?;
        let token = SubscriptionToken::next();
        let registration = Registration {
            source: self.source.handle().clone(),
            subscription,
            slot: Arc::clone(&slot),
        };
        if !session.subscriptions().insert(token, registration) {
            // Disposed while the subscribe was in flight.
            slot.active.store(false, Ordering::SeqCst);
            return Err(Error::Disposed);
        }
        tracing::debug!(
            "Subscribed to {}.{event} as {token:?}",
            self.source.handle()
        );
        Ok(token)
    }

    /// Remove the registration for `token`, whichever bridge of this session
    /// issued it. Unknown and already removed tokens are ignored.
    ///
    /// Once this returns, at most one notification that was already being
    /// delivered can still reach the callback.
    pub async fn unsubscribe(&self, token: SubscriptionToken) {
        let session = self.source.session();
        let Some(registration) = session.subscriptions().remove(token) else {
            return;
        };
        registration.slot.active.store(false, Ordering::SeqCst);

        match session.channel_for(&registration.source) {
            Ok(channel) => {
                let event = &registration.slot.event;
                if let Err(e) = session
                    .call(event, channel.unsubscribe(registration.subscription))
                    .await
                {
                    tracing::warn!("Failed to unsubscribe from {event}: {e}");
                }
            }
            // The channel this was registered on is already gone.
            Err(e) => tracing::debug!("Skipping remote unsubscribe for {token:?}: {e}"),
        }
    }

    /// Remove every registration on this bridge's object.
    pub async fn unsubscribe_all(&self) {
        let tokens = self
            .source
            .session()
            .subscriptions()
            .tokens_for(self.source.handle());
        for token in tokens {
            self.unsubscribe(token).await;
        }
    }

    /// Whether `token` is still registered on this session.
    pub fn is_subscribed(&self, token: SubscriptionToken) -> bool {
        self.source.session().subscriptions().contains(token)
    }

    /// Number of registrations on this bridge's object.
    pub fn len(&self) -> usize {
        self.source
            .session()
            .subscriptions()
            .tokens_for(self.source.handle())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
