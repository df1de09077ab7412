//! The invocation channel between remora and an agent running inside a
//! target process.
//!
//! The target exposes its managed object graph through a small agent that
//! speaks JSON messages (see `remora-protocol`) over a framed TCP stream:
//!
//! ```text
//! remora session / proxies
//!     └── dyn InvocationChannel (this crate)
//!           ├── TcpChannel ── framed JSON over TCP ── agent in target process
//!           └── MemoryChannel ── in-process object graph (tests, demos)
//! ```
//!
//! # Architecture
//!
//! - **Transport** (`transport.rs`): block-layer framing over any async stream
//! - **Channel** (`channel.rs`): the `InvocationChannel` and `Connector` traits
//! - **TCP** (`tcp.rs`): request/response correlation and event routing
//! - **Memory** (`memory.rs`): a scripted loopback target
//!
//! # Example
//!
//! ```rust,no_run
//! use remora_channel::{Connector, TcpConnector};
//!
//! # async fn example() -> remora_channel::Result<()> {
//! let channel = TcpConnector::new("localhost", 7821).connect("example").await?;
//! let user = channel.root("CurrentUser").await?;
//! let name = channel.get_member(user.id, "Name").await?;
//! println!("logged in as {name}");
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use channel::{Connector, EventSink, InvocationChannel};
pub use error::{ChannelError, Result};
pub use tcp::{TcpChannel, TcpConnector};
