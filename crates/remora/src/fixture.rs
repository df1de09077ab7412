//! One shared session for a whole test suite.
//!
//! Establishing a session is expensive, so suites set one up once and hand
//! clones of it to every test. The fixture owns that session explicitly
//! instead of keeping it in a global.
//!
//! ```no_run
//! use std::sync::Arc;
//! use remora::{Credentials, SessionFixture, SessionOptions};
//!
//! # async fn example() -> remora::Result<()> {
//! let options = SessionOptions::from_env()?;
//! let connector = Arc::new(options.tcp_connector());
//! let fixture = SessionFixture::new(options, connector);
//!
//! let session = fixture.setup(Some(Credentials::from_env()?)).await?;
//! // ... run tests against `session` ...
//! fixture.teardown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use remora_channel::Connector;
use tokio::sync::Mutex;

use crate::config::{Credentials, SessionOptions};
use crate::error::{Error, Result};
use crate::session::Session;

pub struct SessionFixture {
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    current: Mutex<Option<Session>>,
}

impl SessionFixture {
    pub fn new(options: SessionOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            current: Mutex::new(None),
        }
    }

    /// Connect, and log on when `credentials` are given.
    ///
    /// A session left by an earlier `setup` is reused as long as it is not
    /// disposed; in that case nothing is re-established.
    pub async fn setup(&self, credentials: Option<Credentials>) -> Result<Session> {
        let mut current = self.current.lock().await;
        let session = match current.as_ref() {
            Some(session) if !session.is_disposed() => session.clone(),
            _ => Session::new(self.options.clone(), Arc::clone(&self.connector)),
        };
        *current = Some(session.clone());

        session.connect(self.options.connect_timeout).await?;
        if let Some(credentials) = credentials {
            if !session.is_logged_in() {
                session.log_on(credentials).await?;
            }
        }
        Ok(session)
    }

    /// The session from the last `setup`, if not yet torn down.
    pub async fn session(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Log off, dispose, and verify the session is fully released.
    ///
    /// Fails with [`Error::Timeout`] if disposal is not observed within the
    /// configured dispose timeout. A second teardown is a no-op.
    pub async fn teardown(&self) -> Result<()> {
        let Some(session) = self.current.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.log_off(self.options.auth_timeout).await {
            tracing::warn!("Log off during teardown failed: {e}");
        }

        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);
        session.on_disposed(move || flag.store(true, Ordering::SeqCst));
        session.dispose();

        let budget = self.options.dispose_timeout;
        let completed = Session::wait_for_condition(
            || disposed.load(Ordering::SeqCst),
            self.options.poll_interval,
            budget,
        )
        .await;
        if !completed {
            return Err(Error::timeout("dispose", budget));
        }

        if let Some(endpoint) = session.endpoint() {
            return Err(Error::Connection(format!(
                "endpoint {endpoint} still set after disposal"
            )));
        }
        tracing::info!("Session {} torn down", session.id());
        Ok(())
    }
}
