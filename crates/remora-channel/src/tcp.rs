//! TCP client for an agent listening inside the target process.
//!
//! `TcpChannel` runs two tasks per connection. The writer task owns the write
//! half and sends queued frames whole, so a caller that stops waiting never
//! leaves a partial frame on the socket. The reader task routes every
//! incoming frame: responses go to the caller waiting on the matching request
//! id, notifications go to the sink of their subscription. Replies may arrive
//! out of order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remora_protocol::{
    Command, ErrorCode, Notification, ObjectId, ObjectRef, Request, Response, ResponseData,
    ResponseResult, ServerMessage, SubscriptionId, TypeInfo, Value,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{Connector, EventSink, InvocationChannel};
use crate::error::{ChannelError, Result};
use crate::transport::{FrameReader, FrameWriter};

type Reply = Result<Option<ResponseData>>;

/// Frames queued ahead of the writer task before senders wait.
const OUTGOING_QUEUE: usize = 64;

enum Outgoing {
    Frame(Vec<u8>),
    /// Last frame on the connection; the write half is shut down after it.
    Goodbye {
        frame: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the channel and its reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    /// Sinks waiting for the reply to their `Subscribe` request, keyed by request id.
    /// Installed by the reader task so no notification can overtake them.
    pending_sinks: Mutex<HashMap<u64, EventSink>>,
    sinks: Mutex<HashMap<SubscriptionId, EventSink>>,
    closed: AtomicBool,
}

impl Shared {
    fn complete(&self, response: Response) {
        let waiter = lock(&self.pending).remove(&response.id);
        let Some(waiter) = waiter else {
            tracing::trace!("Dropping reply for abandoned request {}", response.id);
            return;
        };
        let sink = lock(&self.pending_sinks).remove(&response.id);
        let reply = match response.result {
            ResponseResult::Ok { data } => {
                if let (Some(sink), Some(ResponseData::Subscription { subscription })) =
                    (sink, &data)
                {
                    lock(&self.sinks).insert(*subscription, sink);
                }
                Ok(data)
            }
            ResponseResult::Error { code, message } => Err(ChannelError::Remote { code, message }),
        };
        let _ = waiter.send(reply);
    }

    fn dispatch(&self, notification: Notification) {
        let sink = lock(&self.sinks).get(&notification.subscription).cloned();
        match sink {
            Some(sink) => sink(notification),
            None => tracing::trace!(
                "Ignoring {} for inactive subscription {}",
                notification.event,
                notification.subscription
            ),
        }
    }

    /// Mark the channel closed and fail every outstanding request.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waiters: Vec<_> = lock(&self.pending).drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ChannelError::ConnectionClosed));
        }
        lock(&self.pending_sinks).clear();
        lock(&self.sinks).clear();
    }
}

/// Removes the pending entry if the caller stops waiting (e.g. on timeout).
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
        lock(&self.shared.pending_sinks).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A connection to an agent over TCP.
pub struct TcpChannel {
    endpoint: SocketAddr,
    outgoing: mpsc::Sender<Outgoing>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    process_id: AtomicU64,
}

impl TcpChannel {
    /// Wrap a connected stream and start the reader and writer tasks. No
    /// handshake is sent.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let endpoint = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let shared = Arc::new(Shared::default());
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let reader = tokio::spawn(read_loop(FrameReader::new(read), Arc::clone(&shared)));
        let writer = tokio::spawn(write_loop(
            FrameWriter::new(write),
            queue,
            Arc::clone(&shared),
        ));

        Ok(Self {
            endpoint,
            outgoing,
            shared,
            tasks: Mutex::new(vec![reader, writer]),
            next_id: AtomicU64::new(1),
            process_id: AtomicU64::new(0),
        })
    }

    /// Connect to an agent and perform the handshake.
    pub async fn connect(addr: &str, client: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChannelError::Unreachable(format!("{addr}: {e}")))?;
        let channel = Self::new(stream)?;
        channel.handshake(client).await?;
        tracing::info!(
            "Connected to agent at {} (pid {})",
            channel.endpoint,
            channel.process_id()
        );
        Ok(channel)
    }

    /// Process id reported by the agent during the handshake.
    pub fn process_id(&self) -> u32 {
        self.process_id.load(Ordering::Relaxed) as u32
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn handshake(&self, client: &str) -> Result<()> {
        let nonce: u64 = rand::random();
        tracing::debug!("Sending handshake as {client:?}");
        let data = self
            .send_command(Command::Handshake {
                client: client.to_string(),
                nonce,
            })
            .await?;
        match data {
            Some(ResponseData::Handshake {
                nonce: echoed,
                process_id,
            }) if echoed == nonce => {
                self.process_id.store(process_id as u64, Ordering::Relaxed);
                Ok(())
            }
            Some(ResponseData::Handshake { .. }) => {
                Err(ChannelError::Protocol("handshake nonce mismatch".into()))
            }
            other => Err(ChannelError::Protocol(format!(
                "unexpected handshake reply: {other:?}"
            ))),
        }
    }

    /// Send a command and wait for its response.
    async fn send_command(&self, command: Command) -> Reply {
        self.send_command_with_sink(command, None).await
    }

    async fn send_command_with_sink(&self, command: Command, sink: Option<EventSink>) -> Reply {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }

        let id = self.next_id();
        let name = command.name();
        let json = serde_json::to_vec(&Request { id, command })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        if let Some(sink) = sink {
            lock(&self.shared.pending_sinks).insert(id, sink);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        // The reader may have shut down between the first check and the insert.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }

        tracing::trace!("Sending {name} (id={id})");
        // Dropping this future while it waits for queue space sends nothing;
        // once queued, the frame is written in full.
        self.outgoing
            .send(Outgoing::Frame(json))
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;

        rx.await.map_err(|_| ChannelError::ConnectionClosed)?
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    async fn expect_value(&self, command: Command) -> Result<Value> {
        match self.send_command(command).await? {
            Some(ResponseData::Value { value }) => Ok(value),
            None => Ok(Value::Null),
            other => Err(ChannelError::Protocol(format!(
                "expected a value, got {other:?}"
            ))),
        }
    }
}

async fn read_loop(mut reader: FrameReader<OwnedReadHalf>, shared: Arc<Shared>) {
    loop {
        let frame = match reader.recv_message().await {
            Ok(frame) => frame,
            Err(ChannelError::ConnectionClosed) => {
                tracing::debug!("Agent closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Agent connection failed: {e}");
                break;
            }
        };

        match serde_json::from_slice::<ServerMessage>(&frame) {
            Ok(ServerMessage::Response(response)) => shared.complete(response),
            Ok(ServerMessage::Event(notification)) => shared.dispatch(notification),
            Err(e) => tracing::warn!("Discarding malformed message from agent: {e}"),
        }
    }
    shared.shut();
}

async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut queue: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
) {
    while let Some(outgoing) = queue.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                if let Err(e) = writer.send_message(&frame).await {
                    tracing::warn!("Writing to agent failed: {e}");
                    shared.shut();
                    return;
                }
            }
            Outgoing::Goodbye { frame, done } => {
                let result = match writer.send_message(&frame).await {
                    Ok(()) => writer.shutdown().await,
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
                return;
            }
        }
    }
}

#[async_trait]
impl InvocationChannel for TcpChannel {
    fn endpoint(&self) -> Option<SocketAddr> {
        if self.shared.closed.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.endpoint)
        }
    }

    async fn authenticate(&self, identity: &str, secret: &str) -> Result<()> {
        self.send_command(Command::Authenticate {
            identity: identity.to_string(),
            secret: secret.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn log_off(&self) -> Result<()> {
        self.send_command(Command::LogOff).await?;
        Ok(())
    }

    async fn root(&self, name: &str) -> Result<ObjectRef> {
        let value = self
            .expect_value(Command::Root {
                name: name.to_string(),
            })
            .await?;
        match value {
            Value::Object(r) => Ok(r),
            Value::Null => Err(ChannelError::remote(
                ErrorCode::ObjectNotFound,
                format!("no root object named {name}"),
            )),
            other => Err(ChannelError::Protocol(format!(
                "root {name} is not an object: {other}"
            ))),
        }
    }

    async fn describe_type(&self, type_name: &str) -> Result<TypeInfo> {
        let data = self
            .send_command(Command::DescribeType {
                type_name: type_name.to_string(),
            })
            .await?;
        match data {
            Some(ResponseData::Type { type_info }) => Ok(type_info),
            other => Err(ChannelError::Protocol(format!(
                "expected type info for {type_name}, got {other:?}"
            ))),
        }
    }

    async fn get_member(&self, object: ObjectId, member: &str) -> Result<Value> {
        self.expect_value(Command::GetMember {
            object,
            member: member.to_string(),
        })
        .await
    }

    async fn set_member(&self, object: ObjectId, member: &str, value: Value) -> Result<()> {
        self.send_command(Command::SetMember {
            object,
            member: member.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    async fn invoke_member(
        &self,
        object: ObjectId,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.expect_value(Command::InvokeMember {
            object,
            member: member.to_string(),
            args,
        })
        .await
    }

    async fn subscribe(
        &self,
        object: ObjectId,
        event: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId> {
        let data = self
            .send_command_with_sink(
                Command::Subscribe {
                    object,
                    event: event.to_string(),
                },
                Some(sink),
            )
            .await?;
        match data {
            Some(ResponseData::Subscription { subscription }) => Ok(subscription),
            other => Err(ChannelError::Protocol(format!(
                "expected a subscription id, got {other:?}"
            ))),
        }
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        if lock(&self.shared.sinks).remove(&subscription).is_none() {
            return Ok(());
        }
        self.send_command(Command::Unsubscribe { subscription })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Best effort: tell the agent we are leaving, after anything already
        // queued, then drop the socket.
        let frame = serde_json::to_vec(&Request {
            id: self.next_id(),
            command: Command::Disconnect,
        })?;
        let (done, written) = oneshot::channel();
        let result = match self.outgoing.send(Outgoing::Goodbye { frame, done }).await {
            Ok(()) => written.await.unwrap_or(Err(ChannelError::ConnectionClosed)),
            Err(_) => Err(ChannelError::ConnectionClosed),
        };

        self.abort_tasks();
        self.shared.shut();
        tracing::debug!("Closed agent connection to {}", self.endpoint);
        result
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Connects to an agent at a fixed host and port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, client: &str) -> Result<Arc<dyn InvocationChannel>> {
        let channel = TcpChannel::connect(&self.address(), client).await?;
        Ok(Arc::new(channel))
    }
}
