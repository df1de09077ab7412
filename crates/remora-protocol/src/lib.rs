//! Shared protocol types for communication between a remora client and the
//! agent injected into a target process.
//!
//! The protocol is JSON: one object per frame in each direction. The client
//! sends [`Request`]s; the agent answers each with a [`Response`] carrying the
//! same id and may push [`Notification`]s at any time for active event
//! subscriptions. Both arrive wrapped in a [`ServerMessage`].

use serde::{Deserialize, Serialize};

/// Identifier of an object inside the target process, scoped to one connection.
pub type ObjectId = u64;

/// Identifier the agent assigns to an event subscription.
pub type SubscriptionId = u64;

/// A command sent from the client to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing request ID for correlating responses.
    pub id: u64,
    /// The command to execute.
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the client can send to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum Command {
    /// Open the session. The agent echoes `nonce` back.
    Handshake { client: String, nonce: u64 },

    /// Log on with an identity and secret. The secret is used for this call only.
    Authenticate { identity: String, secret: String },

    /// End the authenticated user session, keeping the connection open.
    LogOff,

    /// Look up a well-known root object by name.
    Root { name: String },

    /// Fetch the member table of a remote type.
    DescribeType { type_name: String },

    /// Read a property.
    GetMember { object: ObjectId, member: String },

    /// Write a property.
    SetMember {
        object: ObjectId,
        member: String,
        value: Value,
    },

    /// Call a method.
    InvokeMember {
        object: ObjectId,
        member: String,
        args: Vec<Value>,
    },

    /// Start forwarding an event raised by `object`.
    Subscribe { object: ObjectId, event: String },

    /// Stop forwarding a previously subscribed event.
    Unsubscribe { subscription: SubscriptionId },

    /// Close the connection. Every object id handed out becomes invalid.
    Disconnect,
}

impl Command {
    /// Short name used in logs and error context. Never includes arguments.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake { .. } => "handshake",
            Command::Authenticate { .. } => "authenticate",
            Command::LogOff => "log_off",
            Command::Root { .. } => "root",
            Command::DescribeType { .. } => "describe_type",
            Command::GetMember { .. } => "get_member",
            Command::SetMember { .. } => "set_member",
            Command::InvokeMember { .. } => "invoke_member",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Disconnect => "disconnect",
        }
    }
}

/// A reference to a live object in the target process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: ObjectId,
    /// Fully-qualified name of the object's declared type.
    #[serde(rename = "type")]
    pub type_name: String,
}

impl ObjectRef {
    pub fn new(id: ObjectId, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
        }
    }
}

/// A value marshaled across the process boundary.
///
/// Everything except [`Value::Object`] is copied by value. Objects travel as
/// references and stay alive inside the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Object(ObjectRef),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::List(_) => "list",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Value::Object(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Object(r) => write!(f, "<{}#{}>", r.type_name, r.id),
            Value::List(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

/// The declared shape of a parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "type", rename_all = "snake_case")]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    Int,
    Float,
    String,
    Object(String),
    List,
}

impl ValueKind {
    /// Whether `value` may be passed where this kind is declared.
    ///
    /// Object slots accept null references; float slots accept integers.
    /// The concrete object type is checked by the target, not here.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueKind::Any, _) => true,
            (ValueKind::Null, Value::Null) => true,
            (ValueKind::Bool, Value::Bool(_)) => true,
            (ValueKind::Int, Value::Int(_)) => true,
            (ValueKind::Float, Value::Float(_) | Value::Int(_)) => true,
            (ValueKind::String, Value::String(_)) => true,
            (ValueKind::Object(_), Value::Object(_) | Value::Null) => true,
            (ValueKind::List, Value::List(_)) => true,
            _ => false,
        }
    }

    /// Whether values of this kind are object references.
    pub fn is_object(&self) -> bool {
        matches!(self, ValueKind::Object(_))
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Object(name) => write!(f, "{name}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// What kind of member a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Property,
    Method,
    Event,
}

/// One member of a remote type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub kind: MemberKind,
    /// Method parameters. For events: the payload kind, if declared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ValueKind>,
    /// Property type or method return type.
    #[serde(default = "any_kind")]
    pub returns: ValueKind,
    /// Only meaningful for properties.
    #[serde(default)]
    pub writable: bool,
}

fn any_kind() -> ValueKind {
    ValueKind::Any
}

impl MemberInfo {
    pub fn property(name: impl Into<String>, returns: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Property,
            params: Vec::new(),
            returns,
            writable: false,
        }
    }

    pub fn writable_property(name: impl Into<String>, returns: ValueKind) -> Self {
        Self {
            writable: true,
            ..Self::property(name, returns)
        }
    }

    pub fn method(name: impl Into<String>, params: Vec<ValueKind>, returns: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Method,
            params,
            returns,
            writable: false,
        }
    }

    pub fn event(name: impl Into<String>, payload: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Event,
            params: vec![payload],
            returns: ValueKind::Null,
            writable: false,
        }
    }
}

/// The member table of a remote type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub members: Vec<MemberInfo>,
}

/// A message sent from the agent back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(Response),
    Event(Notification),
}

/// The reply to a single [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request ID this response corresponds to.
    pub id: u64,
    /// The result of the command.
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

/// Data returned in successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    /// Handshake acknowledgement.
    Handshake { nonce: u64, process_id: u32 },
    /// Result of `DescribeType`.
    Type { type_info: TypeInfo },
    /// Result of `Subscribe`.
    Subscription { subscription: SubscriptionId },
    /// A member value or method result.
    Value { value: Value },
}

/// Failure classes reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Credentials were rejected.
    AuthenticationFailed,
    /// The object id is unknown or has been collected.
    ObjectNotFound,
    /// The type has no member with that name.
    MemberNotFound,
    /// The member exists but holds no value (e.g. an unset optional setting).
    ValueMissing,
    /// The agent rejected the arguments.
    InvalidArguments,
    /// The member threw inside the target.
    Exception,
    /// The command is not supported by this agent.
    Unsupported,
}

/// An event raised inside the target, forwarded for one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subscription: SubscriptionId,
    pub event: String,
    pub sender: Value,
    pub payload: Value,
}

impl Response {
    pub fn ok(id: u64, data: Option<ResponseData>) -> Self {
        Self {
            id,
            result: ResponseResult::Ok { data },
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: ResponseResult::Error {
                code,
                message: message.into(),
            },
        }
    }
}
