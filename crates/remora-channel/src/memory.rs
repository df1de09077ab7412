//! An in-process target: an object graph living in this process, reachable
//! through the same [`InvocationChannel`] interface as a real agent.
//!
//! Used to exercise the session and proxy layers without a second process,
//! and to script failure modes (unreachable target, slow handshake, slow
//! authentication, failing teardown).
//!
//! ```
//! use remora_channel::memory::MemoryTarget;
//! use remora_protocol::{MemberInfo, TypeInfo, Value, ValueKind};
//!
//! let target = MemoryTarget::new();
//! target.define_type(TypeInfo {
//!     name: "User".into(),
//!     members: vec![MemberInfo::property("Name", ValueKind::String)],
//! });
//! let user = target.add_object("User");
//! target.set_property(user.id, "Name", Value::from("Karn"));
//! target.add_root("CurrentUser", user.id);
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use remora_protocol::{
    ErrorCode, MemberKind, Notification, ObjectId, ObjectRef, SubscriptionId, TypeInfo, Value,
};

use crate::channel::{Connector, EventSink, InvocationChannel};
use crate::error::{ChannelError, Result};

/// Implementation of a remote method. Receives the object's properties and the arguments.
pub type MethodFn =
    Arc<dyn Fn(&mut HashMap<String, Value>, &[Value]) -> Result<Value> + Send + Sync>;

struct MemoryObject {
    type_name: String,
    properties: HashMap<String, Value>,
    methods: HashMap<String, MethodFn>,
}

struct Subscription {
    channel: u64,
    object: ObjectId,
    event: String,
    sink: EventSink,
}

#[derive(Default)]
struct TargetState {
    types: HashMap<String, TypeInfo>,
    objects: HashMap<ObjectId, MemoryObject>,
    roots: HashMap<String, ObjectId>,
    credentials: Option<(String, String)>,
    logged_in: bool,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

/// Knobs for scripting connection behaviour.
#[derive(Debug, Clone, Default)]
struct Behaviour {
    unreachable: bool,
    connect_delay: Duration,
    auth_delay: Duration,
    call_delay: Duration,
    fail_close: bool,
}

struct Inner {
    state: Mutex<TargetState>,
    behaviour: Mutex<Behaviour>,
    port: u16,
    next_object: AtomicU64,
    next_subscription: AtomicU64,
    next_channel: AtomicU64,
    handshakes: AtomicUsize,
    closes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A scripted object graph. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryTarget {
    inner: Arc<Inner>,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::with_port(49_152)
    }

    /// Use `port` as the endpoint port reported by channels to this target.
    pub fn with_port(port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TargetState::default()),
                behaviour: Mutex::new(Behaviour::default()),
                port,
                next_object: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
                handshakes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// A connector producing channels to this target.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            target: self.clone(),
        }
    }

    // -- Object graph --

    pub fn define_type(&self, info: TypeInfo) {
        lock(&self.inner.state).types.insert(info.name.clone(), info);
    }

    /// Create an object of `type_name`. The type does not have to be defined.
    pub fn add_object(&self, type_name: &str) -> ObjectRef {
        let id = self.inner.next_object.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.state).objects.insert(
            id,
            MemoryObject {
                type_name: type_name.to_string(),
                properties: HashMap::new(),
                methods: HashMap::new(),
            },
        );
        ObjectRef::new(id, type_name)
    }

    /// Remove an object, as if the target had collected it.
    pub fn remove_object(&self, id: ObjectId) {
        lock(&self.inner.state).objects.remove(&id);
    }

    pub fn set_property(&self, id: ObjectId, name: &str, value: Value) {
        if let Some(object) = lock(&self.inner.state).objects.get_mut(&id) {
            object.properties.insert(name.to_string(), value);
        }
    }

    pub fn clear_property(&self, id: ObjectId, name: &str) {
        if let Some(object) = lock(&self.inner.state).objects.get_mut(&id) {
            object.properties.remove(name);
        }
    }

    pub fn property(&self, id: ObjectId, name: &str) -> Option<Value> {
        lock(&self.inner.state)
            .objects
            .get(&id)
            .and_then(|o| o.properties.get(name).cloned())
    }

    pub fn define_method<F>(&self, id: ObjectId, name: &str, f: F)
    where
        F: Fn(&mut HashMap<String, Value>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if let Some(object) = lock(&self.inner.state).objects.get_mut(&id) {
            object.methods.insert(name.to_string(), Arc::new(f));
        }
    }

    pub fn add_root(&self, name: &str, id: ObjectId) {
        lock(&self.inner.state).roots.insert(name.to_string(), id);
    }

    /// Accept exactly this identity and secret.
    pub fn set_credentials(&self, identity: &str, secret: &str) {
        lock(&self.inner.state).credentials = Some((identity.to_string(), secret.to_string()));
    }

    pub fn is_logged_in(&self) -> bool {
        lock(&self.inner.state).logged_in
    }

    // -- Events --

    /// Raise `event` on `object`, with the object itself as sender.
    /// Returns the number of sinks notified.
    pub fn fire(&self, object: ObjectId, event: &str, payload: Value) -> usize {
        let sender = lock(&self.inner.state)
            .objects
            .get(&object)
            .map(|o| Value::Object(ObjectRef::new(object, o.type_name.clone())))
            .unwrap_or(Value::Null);
        self.fire_from(object, event, sender, payload)
    }

    /// Raise `event` on `object` with an explicit sender value.
    ///
    /// Sinks run synchronously on the calling thread, outside any lock.
    pub fn fire_from(&self, object: ObjectId, event: &str, sender: Value, payload: Value) -> usize {
        let targets: Vec<(SubscriptionId, EventSink)> = lock(&self.inner.state)
            .subscriptions
            .iter()
            .filter(|(_, s)| s.object == object && s.event == event)
            .map(|(id, s)| (*id, Arc::clone(&s.sink)))
            .collect();

        for (subscription, sink) in &targets {
            sink(Notification {
                subscription: *subscription,
                event: event.to_string(),
                sender: sender.clone(),
                payload: payload.clone(),
            });
        }
        targets.len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.state).subscriptions.len()
    }

    // -- Behaviour --

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.inner.behaviour).unreachable = unreachable;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.inner.behaviour).connect_delay = delay;
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        lock(&self.inner.behaviour).auth_delay = delay;
    }

    /// Delay applied to every member access and invocation.
    pub fn set_call_delay(&self, delay: Duration) {
        lock(&self.inner.behaviour).call_delay = delay;
    }

    /// Make `close` report an error (the connection is still released).
    pub fn set_fail_close(&self, fail: bool) {
        lock(&self.inner.behaviour).fail_close = fail;
    }

    /// Number of completed handshakes.
    pub fn handshakes(&self) -> usize {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// Number of channels closed.
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    fn behaviour(&self) -> Behaviour {
        lock(&self.inner.behaviour).clone()
    }
}

/// Produces [`MemoryChannel`]s to a [`MemoryTarget`].
#[derive(Clone)]
pub struct MemoryConnector {
    target: MemoryTarget,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, client: &str) -> Result<Arc<dyn InvocationChannel>> {
        let behaviour = self.target.behaviour();
        if !behaviour.connect_delay.is_zero() {
            tokio::time::sleep(behaviour.connect_delay).await;
        }
        if behaviour.unreachable {
            return Err(ChannelError::Unreachable(format!(
                "no agent listening on port {}",
                self.target.inner.port
            )));
        }

        self.target.inner.handshakes.fetch_add(1, Ordering::SeqCst);
        let id = self.target.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Memory target accepted {client:?} as channel {id}");
        Ok(Arc::new(MemoryChannel {
            target: self.target.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A channel to a [`MemoryTarget`].
pub struct MemoryChannel {
    target: MemoryTarget,
    id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, TargetState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }
        Ok(lock(&self.target.inner.state))
    }

    async fn call_delay(&self) {
        let delay = self.target.behaviour().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn object_mut(state: &mut TargetState, id: ObjectId) -> Result<&mut MemoryObject> {
    state
        .objects
        .get_mut(&id)
        .ok_or_else(|| ChannelError::remote(ErrorCode::ObjectNotFound, format!("object {id}")))
}

fn declared_kind(state: &TargetState, type_name: &str, member: &str) -> Option<MemberKind> {
    state
        .types
        .get(type_name)?
        .members
        .iter()
        .find(|m| m.name == member)
        .map(|m| m.kind)
}

#[async_trait]
impl InvocationChannel for MemoryChannel {
    fn endpoint(&self) -> Option<SocketAddr> {
        if self.closed.load(Ordering::SeqCst) {
            None
        } else {
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, self.target.inner.port)))
        }
    }

    async fn authenticate(&self, identity: &str, secret: &str) -> Result<()> {
        let delay = self.target.behaviour().auth_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state()?;
        let accepted = match &state.credentials {
            Some((id, pw)) => id == identity && pw == secret,
            None => true,
        };
        if !accepted {
            return Err(ChannelError::remote(
                ErrorCode::AuthenticationFailed,
                format!("invalid credentials for {identity}"),
            ));
        }
        state.logged_in = true;
        Ok(())
    }

    async fn log_off(&self) -> Result<()> {
        self.state()?.logged_in = false;
        Ok(())
    }

    async fn root(&self, name: &str) -> Result<ObjectRef> {
        let state = self.state()?;
        let id = state.roots.get(name).copied().ok_or_else(|| {
            ChannelError::remote(ErrorCode::ObjectNotFound, format!("no root object named {name}"))
        })?;
        let object = state
            .objects
            .get(&id)
            .ok_or_else(|| ChannelError::remote(ErrorCode::ObjectNotFound, format!("object {id}")))?;
        Ok(ObjectRef::new(id, object.type_name.clone()))
    }

    async fn describe_type(&self, type_name: &str) -> Result<TypeInfo> {
        self.state()?.types.get(type_name).cloned().ok_or_else(|| {
            ChannelError::remote(ErrorCode::Unsupported, format!("unknown type {type_name}"))
        })
    }

    async fn get_member(&self, object: ObjectId, member: &str) -> Result<Value> {
        self.call_delay().await;
        let mut state = self.state()?;
        let type_name = object_mut(&mut state, object)?.type_name.clone();
        let declared = declared_kind(&state, &type_name, member);
        let target = object_mut(&mut state, object)?;

        if let Some(value) = target.properties.get(member) {
            return Ok(value.clone());
        }
        match declared {
            Some(MemberKind::Property) => Err(ChannelError::remote(
                ErrorCode::ValueMissing,
                format!("{type_name}.{member} has no value"),
            )),
            _ => Err(ChannelError::remote(
                ErrorCode::MemberNotFound,
                format!("{type_name} has no property {member}"),
            )),
        }
    }

    async fn set_member(&self, object: ObjectId, member: &str, value: Value) -> Result<()> {
        self.call_delay().await;
        let mut state = self.state()?;
        object_mut(&mut state, object)?
            .properties
            .insert(member.to_string(), value);
        Ok(())
    }

    async fn invoke_member(
        &self,
        object: ObjectId,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.call_delay().await;
        let mut state = self.state()?;
        let target = object_mut(&mut state, object)?;
        let method = target.methods.get(member).cloned().ok_or_else(|| {
            ChannelError::remote(
                ErrorCode::MemberNotFound,
                format!("{} has no method {member}", target.type_name),
            )
        })?;
        method(&mut target.properties, &args)
    }

    async fn subscribe(
        &self,
        object: ObjectId,
        event: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId> {
        let mut state = self.state()?;
        object_mut(&mut state, object)?;
        let id = self
            .target
            .inner
            .next_subscription
            .fetch_add(1, Ordering::Relaxed);
        state.subscriptions.insert(
            id,
            Subscription {
                channel: self.id,
                object,
                event: event.to_string(),
                sink,
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        self.state()?.subscriptions.remove(&subscription);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = lock(&self.target.inner.state);
            state.subscriptions.retain(|_, s| s.channel != self.id);
            state.logged_in = false;
        }
        self.target.inner.closes.fetch_add(1, Ordering::SeqCst);

        if self.target.behaviour().fail_close {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "agent went away during close",
            )));
        }
        Ok(())
    }
}
