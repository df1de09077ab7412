//! Late-bound access to one remote object.
//!
//! An [`ObjectProxy`] borrows its session: it holds a clone of the
//! [`Session`] but never disposes it, and every call fails with
//! [`Error::Disposed`] once the session is gone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use remora_protocol::{ObjectId, Value};
use tokio::sync::OnceCell;

use crate::cast::Cast;
use crate::error::{Error, Result};
use crate::events::EventBridge;
use crate::handle::RemoteHandle;
use crate::resolver::Capabilities;
use crate::session::Session;
use crate::wait;

/// A local stand-in for a remote object.
#[derive(Clone)]
pub struct ObjectProxy {
    session: Session,
    handle: RemoteHandle,
    capabilities: Arc<OnceCell<Arc<Capabilities>>>,
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectProxy").field(&self.handle).finish()
    }
}

impl ObjectProxy {
    /// Build a proxy over `handle`. Fails if the handle came from another session.
    pub fn new(session: Session, handle: RemoteHandle) -> Result<Self> {
        if handle.session() != session.id() {
            return Err(Error::Argument(format!(
                "{handle} was not issued by session {}",
                session.id()
            )));
        }
        Ok(Self::from_handle(session, handle))
    }

    pub(crate) fn from_handle(session: Session, handle: RemoteHandle) -> Self {
        Self {
            session,
            handle,
            capabilities: Arc::new(OnceCell::new()),
        }
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> ObjectId {
        self.handle.object()
    }

    pub fn type_name(&self) -> &str {
        self.handle.type_name()
    }

    /// The members this object's type is known to expose.
    pub async fn capabilities(&self) -> Result<Arc<Capabilities>> {
        self.capabilities
            .get_or_try_init(|| self.session.capabilities(self.handle.type_name()))
            .await
            .cloned()
    }

    /// Read a property.
    pub async fn get_member(&self, name: &str) -> Result<Value> {
        let channel = self.session.channel_for(&self.handle)?;
        self.capabilities().await?.check_property(name)?;
        tracing::trace!("get {}.{name}", self.handle);
        self.session
            .call(name, channel.get_member(self.handle.object(), name))
            .await
    }

    /// Write a property.
    pub async fn set_member(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let channel = self.session.channel_for(&self.handle)?;
        self.capabilities().await?.check_writable(name, &value)?;
        tracing::trace!("set {}.{name}", self.handle);
        self.session
            .call(name, channel.set_member(self.handle.object(), name, value))
            .await
    }

    /// Invoke a method. Arity and argument kinds are checked locally when the
    /// method is declared.
    pub async fn invoke_member(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let channel = self.session.channel_for(&self.handle)?;
        self.capabilities().await?.check_invocation(name, &args)?;
        tracing::trace!("invoke {}.{name}/{}", self.handle, args.len());
        self.session
            .call(name, channel.invoke_member(self.handle.object(), name, args))
            .await
    }

    /// Read a property and cast it.
    pub async fn get<T: Cast>(&self, name: &str) -> Result<T> {
        let value = self.get_member(name).await?;
        self.cast(value)
    }

    /// Invoke a method and cast the result.
    pub async fn invoke<T: Cast>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        let value = self.invoke_member(name, args).await?;
        self.cast(value)
    }

    /// Cast a raw channel value using this proxy's session.
    pub fn cast<T: Cast>(&self, value: Value) -> Result<T> {
        T::cast(&self.session, value)
    }

    /// [`get`](Self::get) with expected absence mapped to `None`.
    pub async fn try_get<T: Cast>(&self, name: &str) -> Result<Option<T>> {
        try_safe(self.get(name)).await
    }

    /// Poll `predicate` at the session's poll interval until it holds.
    ///
    /// Returns `Ok(false)` when `budget` runs out. An error from the
    /// predicate ends the wait.
    pub async fn wait_until<F, Fut>(&self, mut predicate: F, budget: Duration) -> Result<bool>
    where
        F: FnMut(ObjectProxy) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let interval = self.session.options().poll_interval;
        wait::try_wait_for(|| predicate(self.clone()), interval, budget).await
    }

    /// Subscribe to events raised by this object.
    pub fn events(&self) -> EventBridge {
        EventBridge::new(self.clone())
    }
}

/// Run `operation` once, turning expected absence into `Ok(None)`.
///
/// Only [`EXPECTED_ABSENCE`](crate::error::EXPECTED_ABSENCE) failures are
/// downgraded; every other error is returned unchanged. Nothing is retried.
pub async fn try_safe<T, F>(operation: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    match operation.await {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_expected_absence() => {
            tracing::debug!("Treating as absent: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
