//! The invocation channel boundary.
//!
//! Everything above this crate talks to the target through
//! [`InvocationChannel`]; a [`Connector`] performs the handshake that
//! produces one. Both the TCP client and the in-process memory target
//! implement these traits.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use remora_protocol::{Notification, ObjectId, ObjectRef, SubscriptionId, TypeInfo, Value};

use crate::error::Result;

/// Callback a channel invokes for every notification of one subscription.
///
/// Called on whatever task or thread the channel reads notifications on.
pub type EventSink = Arc<dyn Fn(Notification) + Send + Sync>;

/// A live, handshaken connection to a target process.
#[async_trait]
pub trait InvocationChannel: Send + Sync {
    /// Address of the target's agent. `None` once the channel is closed.
    fn endpoint(&self) -> Option<SocketAddr>;

    /// Log on. `secret` must not outlive the call on either side.
    async fn authenticate(&self, identity: &str, secret: &str) -> Result<()>;

    /// End the authenticated session, keeping the connection.
    async fn log_off(&self) -> Result<()>;

    /// Look up a well-known root object.
    async fn root(&self, name: &str) -> Result<ObjectRef>;

    /// Fetch the member table for a type.
    async fn describe_type(&self, type_name: &str) -> Result<TypeInfo>;

    async fn get_member(&self, object: ObjectId, member: &str) -> Result<Value>;

    async fn set_member(&self, object: ObjectId, member: &str, value: Value) -> Result<()>;

    async fn invoke_member(&self, object: ObjectId, member: &str, args: Vec<Value>)
        -> Result<Value>;

    /// Start forwarding `event` raised by `object` to `sink`.
    async fn subscribe(&self, object: ObjectId, event: &str, sink: EventSink)
        -> Result<SubscriptionId>;

    /// Stop forwarding. The sink is dropped before this returns.
    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Establishes channels to a target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the handshake, announcing ourselves as `client`.
    async fn connect(&self, client: &str) -> Result<Arc<dyn InvocationChannel>>;
}
