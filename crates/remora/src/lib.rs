//! Attach to a running process and work with its live objects.
//!
//! remora talks to an agent inside an already-running target process. A
//! [`Session`] owns the connection; [`ObjectProxy`] turns member reads and
//! method calls on a remote object into channel operations; [`EventBridge`]
//! delivers the target's events to local callbacks.
//!
//! # Architecture
//!
//! ```text
//! domain wrappers (remote_contract!)
//!     └── ObjectProxy ── Cast ── CapabilityResolver
//!           └── Session (lifecycle, disposal, timeouts)
//!                 └── dyn InvocationChannel (remora-channel crate)
//!                       └── agent in the target process
//! ```
//!
//! - **Session** (`session.rs`): connect, authenticate, log off, dispose
//! - **Proxy** (`proxy.rs`): late-bound access, `try_safe`, `wait_until`
//! - **Cast** (`cast.rs`): values to primitives or further proxies
//! - **Events** (`events.rs`): typed callbacks over generic notifications
//! - **Resolver** (`resolver.rs`): per-type member tables for local checks
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use remora::{remote_contract, Credentials, EventHandler, Session, SessionOptions};
//!
//! remote_contract! {
//!     pub struct User;
//! }
//!
//! # async fn example() -> remora::Result<()> {
//! let session = Session::with_tcp(SessionOptions::from_env()?);
//! session.connect(Duration::from_secs(30)).await?;
//! session.log_on(Credentials::from_env()?).await?;
//!
//! let user = User::from(session.root("CurrentUser").await?);
//! let name: String = user.proxy().get("Name").await?;
//! println!("logged in as {name}");
//!
//! let token = user
//!     .proxy()
//!     .events()
//!     .subscribe("NameChanged", EventHandler::payload(|name: String| println!("now {name}")))
//!     .await?;
//! # let _ = token;
//!
//! session.log_off(Duration::from_secs(10)).await?;
//! session.dispose_and_wait(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod cast;
pub mod config;
pub mod error;
pub mod events;
pub mod fixture;
pub mod handle;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod wait;

// Re-export key types
pub use cast::Cast;
pub use config::{Credentials, SessionOptions};
pub use error::{Error, Result};
pub use events::{EventBridge, EventHandler, SubscriptionToken};
pub use fixture::SessionFixture;
pub use handle::{RemoteHandle, SessionId};
pub use proxy::{try_safe, ObjectProxy};
pub use resolver::{Capabilities, CapabilityResolver};
pub use session::{DisposalSignal, Session, SessionState, WeakSession};
pub use wait::wait_for_condition;

pub use remora_protocol::{ErrorCode, MemberInfo, MemberKind, ObjectRef, TypeInfo, Value, ValueKind};
