//! The session: owner of the invocation channel and its lifecycle.
//!
//! ```text
//! Disconnected → Connecting → Connected → LoggingIn → LoggedIn
//!                                 ↑                      ↓
//!                                 └────── LoggingOff ←───┘
//!
//! Disposed is reachable from every state and never left.
//! ```
//!
//! A `Session` is a cheap handle over shared state; clone it freely and hand
//! the clones to proxies and event bridges. Connect, authenticate, log-off and
//! disconnect are serialized by an async lifecycle lock. Dispose never takes
//! that lock, so it cannot get stuck behind a hung handshake.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use remora_channel::{ChannelError, Connector, InvocationChannel};
use remora_protocol::{ErrorCode, ObjectRef};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::{Credentials, SessionOptions};
use crate::error::{Error, Result};
use crate::events::Registry;
use crate::handle::{RemoteHandle, SessionId};
use crate::proxy::ObjectProxy;
use crate::resolver::{Capabilities, CapabilityResolver};
use crate::wait;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    LoggingIn,
    LoggedIn,
    LoggingOff,
    Disposed,
}

impl SessionState {
    /// Whether a channel is established in this state.
    pub fn has_channel(self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::LoggingIn
                | SessionState::LoggedIn
                | SessionState::LoggingOff
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::LoggingIn => "logging in",
            SessionState::LoggedIn => "logged in",
            SessionState::LoggingOff => "logging off",
            SessionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The live channel. `epoch` increases with every successful connect.
#[derive(Default)]
struct Link {
    channel: Option<Arc<dyn InvocationChannel>>,
    endpoint: Option<SocketAddr>,
    epoch: u64,
}

type Listener = Box<dyn FnOnce() + Send>;

/// Disposal-completion notification. Fires once; late listeners run at once.
struct Disposal {
    done: watch::Sender<bool>,
    listeners: Mutex<Option<Vec<Listener>>>,
}

impl Disposal {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            done,
            listeners: Mutex::new(Some(Vec::new())),
        }
    }

    fn subscribe(&self, listener: Listener) {
        let mut pending = lock(&self.listeners);
        match pending.as_mut() {
            Some(list) => list.push(listener),
            None => {
                drop(pending);
                listener();
            }
        }
    }

    fn complete(&self) {
        self.done.send_replace(true);
        let listeners = lock(&self.listeners).take().unwrap_or_default();
        for listener in listeners {
            listener();
        }
    }
}

struct Shared {
    id: SessionId,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    link: Mutex<Link>,
    disposed: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    resolver: CapabilityResolver,
    subscriptions: Registry,
    disposal: Disposal,
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `next` unless the session is already disposed.
    fn set_state(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Disposed {
            return false;
        }
        *state = next;
        true
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Restores a stable state unless disarmed. Covers errors, timeouts and
/// the enclosing future being dropped mid-transition.
struct Rollback<'a> {
    shared: &'a Shared,
    to: SessionState,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn new(shared: &'a Shared, to: SessionState) -> Self {
        Self {
            shared,
            to,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.set_state(self.to);
        }
    }
}

/// A connection to one target process, shared by every proxy built on it.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// A session reference that does not keep the session alive.
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.shared.upgrade().map(|shared| Session { shared })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

impl Session {
    pub fn new(options: SessionOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                options,
                connector,
                state: Mutex::new(SessionState::Disconnected),
                link: Mutex::new(Link::default()),
                disposed: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                resolver: CapabilityResolver::new(),
                subscriptions: Registry::new(),
                disposal: Disposal::new(),
            }),
        }
    }

    /// A session reaching its target over TCP at `options.host:options.port`.
    pub fn with_tcp(options: SessionOptions) -> Self {
        let connector = Arc::new(options.tcp_connector());
        Self::new(options, connector)
    }

    /// Create a session and connect it within the configured connect timeout.
    pub async fn open(options: SessionOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let budget = options.connect_timeout;
        let session = Self::new(options, connector);
        session.connect(budget).await?;
        Ok(session)
    }

    // -- Lifecycle --

    /// Establish the channel.
    ///
    /// Already connected (or logged in) is a no-op returning the same session.
    /// On failure or timeout the session is back to `Disconnected`.
    pub async fn connect(&self, budget: Duration) -> Result<Session> {
        self.ensure_live()?;
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.ensure_live()?;

        if self.state().has_channel() {
            tracing::debug!("Session {} already connected", self.shared.id);
            return Ok(self.clone());
        }

        self.shared.set_state(SessionState::Connecting);
        let rollback = Rollback::new(&self.shared, SessionState::Disconnected);
        let client = &self.shared.options.client_name;
        tracing::info!("Session {} connecting as {client:?}", self.shared.id);

        let channel = match timeout(budget, self.shared.connector.connect(client)).await {
            Err(_) => {
                tracing::warn!("Session {} connect timed out after {budget:?}", self.shared.id);
                return Err(self.fail(Error::timeout("connect", budget)));
            }
            Ok(Err(e)) => return Err(self.classify(e, "connect")),
            Ok(Ok(channel)) => channel,
        };

        {
            let mut link = lock(&self.shared.link);
            // `set_state` also fails if dispose slipped in after the flag check.
            if !self.is_disposed() && self.shared.set_state(SessionState::Connected) {
                link.epoch += 1;
                link.endpoint = channel.endpoint();
                link.channel = Some(Arc::clone(&channel));
                rollback.disarm();
                // A dispose already under way will take the channel from the link.
                if self.is_disposed() {
                    return Err(Error::Disposed);
                }
                tracing::info!(
                    "Session {} connected to {:?}",
                    self.shared.id,
                    link.endpoint
                );
                return Ok(self.clone());
            }
        }

        // Disposed while the handshake was in flight.
        if let Err(e) = timeout(self.shared.options.dispose_timeout, channel.close()).await {
            tracing::warn!("Closing late channel timed out: {e}");
        }
        Err(Error::Disposed)
    }

    /// Log on with `identity` and `secret`.
    ///
    /// Only valid while `Connected`; already `LoggedIn` is a no-op. A rejection
    /// or timeout leaves the session `Connected`. The secret is dropped before
    /// this returns.
    pub async fn authenticate(
        &self,
        identity: &str,
        secret: SecretString,
        budget: Duration,
    ) -> Result<()> {
        self.ensure_live()?;
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.ensure_live()?;

        match self.state() {
            SessionState::LoggedIn => return Ok(()),
            SessionState::Connected => {}
            other => {
                return Err(Error::Connection(format!(
                    "cannot authenticate while {other}"
                )))
            }
        }
        let channel = self.current_channel()?;

        self.shared.set_state(SessionState::LoggingIn);
        let rollback = Rollback::new(&self.shared, SessionState::Connected);
        tracing::info!("Session {} authenticating as {identity:?}", self.shared.id);

        let outcome = timeout(budget, channel.authenticate(identity, secret.expose_secret())).await;
        drop(secret);

        match outcome {
            Err(_) => Err(self.fail(Error::timeout("authenticate", budget))),
            Ok(Err(e)) => {
                let err = self.classify(e, "authenticate");
                tracing::warn!("Session {} authentication failed: {err}", self.shared.id);
                Err(err)
            }
            Ok(Ok(())) => {
                if !self.shared.set_state(SessionState::LoggedIn) {
                    return Err(Error::Disposed);
                }
                rollback.disarm();
                tracing::info!("Session {} logged in", self.shared.id);
                Ok(())
            }
        }
    }

    /// [`authenticate`](Self::authenticate) with stored credentials and the
    /// configured auth timeout.
    pub async fn log_on(&self, credentials: Credentials) -> Result<()> {
        let Credentials { identity, secret } = credentials;
        self.authenticate(&identity, secret, self.shared.options.auth_timeout)
            .await
    }

    /// `LoggedIn` → `Connected`. A no-op when not logged in.
    pub async fn log_off(&self, budget: Duration) -> Result<()> {
        self.ensure_live()?;
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.log_off_locked(budget).await
    }

    async fn log_off_locked(&self, budget: Duration) -> Result<()> {
        self.ensure_live()?;
        if self.state() != SessionState::LoggedIn {
            return Ok(());
        }
        let channel = self.current_channel()?;

        self.shared.set_state(SessionState::LoggingOff);
        let rollback = Rollback::new(&self.shared, SessionState::LoggedIn);

        match timeout(budget, channel.log_off()).await {
            Err(_) => Err(self.fail(Error::timeout("log off", budget))),
            Ok(Err(e)) => Err(self.classify(e, "log off")),
            Ok(Ok(())) => {
                if !self.shared.set_state(SessionState::Connected) {
                    return Err(Error::Disposed);
                }
                rollback.disarm();
                tracing::info!("Session {} logged off", self.shared.id);
                Ok(())
            }
        }
    }

    /// Release the channel but keep the session usable for a later
    /// [`connect`](Self::connect). Logs off first when logged in.
    ///
    /// Handles obtained before the disconnect stay invalid after reconnecting.
    pub async fn disconnect(&self, budget: Duration) -> Result<()> {
        self.ensure_live()?;
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.ensure_live()?;

        if !self.state().has_channel() {
            return Ok(());
        }
        if let Err(e) = self.log_off_locked(budget).await {
            tracing::warn!("Session {} log off before disconnect failed: {e}", self.shared.id);
        }

        let channel = {
            let mut link = lock(&self.shared.link);
            link.endpoint = None;
            link.channel.take()
        };
        self.shared.set_state(SessionState::Disconnected);
        if let Some(channel) = channel {
            match timeout(budget, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Error closing channel: {e}"),
                Err(_) => tracing::warn!("Closing channel timed out after {budget:?}"),
            }
        }
        tracing::info!("Session {} disconnected", self.shared.id);
        Ok(())
    }

    /// Tear the session down. Idempotent and safe to call concurrently.
    ///
    /// The disposed flag is set before the channel is released, so calls made
    /// after this returns fail with [`Error::Disposed`]. The channel is closed
    /// on a background task (bounded by the dispose timeout) and completion is
    /// signalled to [`on_disposed`](Self::on_disposed) listeners once it is
    /// done. Release failures are logged, never returned.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = std::mem::replace(&mut *lock(&self.shared.state), SessionState::Disposed);
        tracing::info!("Disposing session {} (was {previous})", self.shared.id);

        let channel = {
            let mut link = lock(&self.shared.link);
            link.endpoint = None;
            link.channel.take()
        };
        self.shared.resolver.clear();
        self.shared.subscriptions.close();

        let Some(channel) = channel else {
            self.shared.disposal.complete();
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(&self.shared);
                runtime.spawn(async move {
                    let budget = shared.options.dispose_timeout;
                    match timeout(budget, channel.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Error releasing channel during dispose: {e}"),
                        Err(_) => {
                            tracing::warn!("Releasing channel timed out after {budget:?}")
                        }
                    }
                    shared.disposal.complete();
                    tracing::info!("Session {} disposed", shared.id);
                });
            }
            Err(_) => {
                tracing::debug!("No runtime to close the channel on; dropping it");
                drop(channel);
                self.shared.disposal.complete();
            }
        }
    }

    /// Run `listener` once disposal completes, or now if it already has.
    pub fn on_disposed(&self, listener: impl FnOnce() + Send + 'static) {
        self.shared.disposal.subscribe(Box::new(listener));
    }

    pub fn disposal(&self) -> DisposalSignal {
        DisposalSignal {
            done: self.shared.disposal.done.subscribe(),
        }
    }

    /// Dispose and wait up to `budget` for completion.
    pub async fn dispose_and_wait(&self, budget: Duration) -> bool {
        let mut signal = self.disposal();
        self.dispose();
        timeout(budget, signal.wait()).await.is_ok()
    }

    /// Poll `predicate` every `interval` for at most `budget`.
    ///
    /// See [`wait::wait_for_condition`].
    pub async fn wait_for_condition<F>(predicate: F, interval: Duration, budget: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        wait::wait_for_condition(predicate, interval, budget).await
    }

    // -- Objects --

    /// A proxy for the target's well-known root object `name`.
    pub async fn root(&self, name: &str) -> Result<ObjectProxy> {
        let (channel, epoch) = self.live_channel()?;
        let object = self.call(name, channel.root(name)).await?;
        Ok(ObjectProxy::from_handle(
            self.clone(),
            RemoteHandle::new(self.shared.id, epoch, object),
        ))
    }

    /// The capabilities of `type_name`, fetched once per session.
    pub async fn capabilities(&self, type_name: &str) -> Result<Arc<Capabilities>> {
        if let Some(cached) = self.shared.resolver.cached(type_name) {
            return Ok(cached);
        }
        let (channel, _) = self.live_channel()?;
        let capabilities = match self.call(type_name, channel.describe_type(type_name)).await {
            Ok(info) => Capabilities::from_type_info(info),
            Err(e) if e.remote_code() == Some(ErrorCode::Unsupported) => {
                tracing::debug!("Target cannot describe {type_name}; skipping local checks");
                Capabilities::unknown(type_name)
            }
            Err(e) => return Err(e),
        };
        Ok(self.shared.resolver.insert(capabilities))
    }

    // -- Accessors --

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().has_channel()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == SessionState::LoggedIn
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// The target's address. `None` unless connected.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        lock(&self.shared.link).endpoint
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // -- Dispatch plumbing for proxies and event bridges --

    /// Wrap an object reference received on the current connection.
    pub(crate) fn adopt(&self, object: ObjectRef) -> RemoteHandle {
        let epoch = lock(&self.shared.link).epoch;
        RemoteHandle::new(self.shared.id, epoch, object)
    }

    /// The channel `handle` must be dispatched on.
    pub(crate) fn channel_for(&self, handle: &RemoteHandle) -> Result<Arc<dyn InvocationChannel>> {
        if handle.session() != self.shared.id {
            return Err(Error::Argument(format!(
                "{handle} belongs to session {}, not {}",
                handle.session(),
                self.shared.id
            )));
        }
        self.ensure_live()?;
        let link = lock(&self.shared.link);
        if link.epoch != handle.epoch() {
            return Err(Error::Connection(format!(
                "{handle} was obtained on an earlier connection"
            )));
        }
        link.channel
            .clone()
            .ok_or_else(|| Error::Connection("session is not connected".into()))
    }

    pub(crate) fn subscriptions(&self) -> &Registry {
        &self.shared.subscriptions
    }

    /// Await a channel operation on `member` within the call timeout.
    pub(crate) async fn call<T, F>(&self, member: &str, operation: F) -> Result<T>
    where
        F: Future<Output = remora_channel::Result<T>>,
    {
        let budget = self.shared.options.call_timeout;
        match timeout(budget, operation).await {
            Err(_) => {
                tracing::warn!("Call to {member} timed out after {budget:?}");
                Err(self.fail(Error::timeout("remote call", budget)))
            }
            Ok(Err(e)) => Err(self.classify(e, member)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn current_channel(&self) -> Result<Arc<dyn InvocationChannel>> {
        self.live_channel().map(|(channel, _)| channel)
    }

    fn live_channel(&self) -> Result<(Arc<dyn InvocationChannel>, u64)> {
        self.ensure_live()?;
        let link = lock(&self.shared.link);
        let channel = link
            .channel
            .clone()
            .ok_or_else(|| Error::Connection("session is not connected".into()))?;
        Ok((channel, link.epoch))
    }

    /// Any failure observed after disposal is reported as `Disposed`.
    fn fail(&self, err: Error) -> Error {
        if self.is_disposed() {
            Error::Disposed
        } else {
            err
        }
    }

    fn classify(&self, err: ChannelError, member: &str) -> Error {
        self.fail(Error::from_channel(err, member))
    }
}

/// Observes disposal completion.
pub struct DisposalSignal {
    done: watch::Receiver<bool>,
}

impl DisposalSignal {
    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolve once disposal has completed.
    pub async fn wait(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}
