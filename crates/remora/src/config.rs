//! Session configuration and credentials.
//!
//! Both can be built in code or read from the environment:
//!
//! | variable | field | default |
//! |---|---|---|
//! | `REMORA_HOST` | [`SessionOptions::host`] | `localhost` |
//! | `REMORA_PORT` | [`SessionOptions::port`] | `7821` |
//! | `REMORA_CLIENT` | [`SessionOptions::client_name`] | `remora` |
//! | `REMORA_CONNECT_TIMEOUT_MS` | [`SessionOptions::connect_timeout`] | 30 s |
//! | `REMORA_AUTH_TIMEOUT_MS` | [`SessionOptions::auth_timeout`] | 30 s |
//! | `REMORA_CALL_TIMEOUT_MS` | [`SessionOptions::call_timeout`] | 10 s |
//! | `REMORA_DISPOSE_TIMEOUT_MS` | [`SessionOptions::dispose_timeout`] | 5 s |
//! | `REMORA_POLL_INTERVAL_MS` | [`SessionOptions::poll_interval`] | 100 ms |
//! | `REMORA_USERNAME` | [`Credentials::identity`] | required |
//! | `REMORA_PASSWORD` | [`Credentials::secret`] | required |

use std::fmt;
use std::time::Duration;

use remora_channel::TcpConnector;
use secrecy::SecretString;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 7821;

/// How to reach the target and how long to wait for it.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    /// Name announced to the agent during the handshake.
    pub client_name: String,
    pub connect_timeout: Duration,
    /// Budget for authentication and log-off.
    pub auth_timeout: Duration,
    /// Budget for every member read, write and invocation.
    pub call_timeout: Duration,
    /// Budget for releasing the channel and for waiting on disposal.
    pub dispose_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_name: "remora".to_string(),
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            dispose_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SessionOptions {
    /// Defaults overridden by any `REMORA_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(host) = lookup("REMORA_HOST") {
            options.host = host;
        }
        if let Some(port) = lookup("REMORA_PORT") {
            options.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Argument(format!("REMORA_PORT is not a port: {port:?}")))?;
        }
        if let Some(client) = lookup("REMORA_CLIENT") {
            options.client_name = client;
        }
        let millis = |key: &str, slot: &mut Duration| -> Result<()> {
            if let Some(raw) = lookup(key) {
                let ms: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Argument(format!("{key} is not milliseconds: {raw:?}")))?;
                *slot = Duration::from_millis(ms);
            }
            Ok(())
        };
        millis("REMORA_CONNECT_TIMEOUT_MS", &mut options.connect_timeout)?;
        millis("REMORA_AUTH_TIMEOUT_MS", &mut options.auth_timeout)?;
        millis("REMORA_CALL_TIMEOUT_MS", &mut options.call_timeout)?;
        millis("REMORA_DISPOSE_TIMEOUT_MS", &mut options.dispose_timeout)?;
        millis("REMORA_POLL_INTERVAL_MS", &mut options.poll_interval)?;
        Ok(options)
    }

    /// Connector for a TCP agent at `host:port`.
    pub fn tcp_connector(&self) -> TcpConnector {
        TcpConnector::new(self.host.clone(), self.port)
    }
}

/// An identity and its secret. The secret is redacted from `Debug`.
pub struct Credentials {
    pub identity: String,
    pub secret: SecretString,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Read `REMORA_USERNAME` and `REMORA_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let identity = lookup("REMORA_USERNAME")
            .ok_or_else(|| Error::Argument("REMORA_USERNAME is not set".into()))?;
        let secret = lookup("REMORA_PASSWORD")
            .ok_or_else(|| Error::Argument("REMORA_PASSWORD is not set".into()))?;
        Ok(Self::new(identity, secret))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
