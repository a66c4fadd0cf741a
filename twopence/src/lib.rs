//! # twopence
//!
//! **A test-harness transport and transaction-multiplexing kernel, built
//! on `io_uring`.**
//!
//! `twopence` drives test commands, file transfers, and interactive chat
//! sessions against a target machine through a pluggable byte-pipe — a
//! local in-process responder today, with `ssh`, `virtio`, `serial`, and
//! `chroot` plugins reserved for transports this crate doesn't dial
//! itself (§1, §6). One framed binary protocol multiplexes any number of
//! concurrent transactions over that one pipe.
//!
//! ## Architecture
//!
//! - **`twopence-core`**: buffers, the non-blocking duplex endpoint,
//!   environment, error types, cancellation-safety guard.
//! - **`twopence-protocol`**: the wire codec and transaction-multiplexing
//!   connection — a sans-IO state machine, independently testable without
//!   a socket.
//! - **`twopence`** (this crate): the `Target` façade and plugin registry.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use twopence::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut target = Target::connect("local:").await?;
//! let status = target.run_test(Command::new("echo hello")).await?;
//! println!("exit code: {}", status.minor);
//! target.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Interactive chat
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use twopence::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut target = Target::connect("local:").await?;
//! let (xid, _pid) = target.chat_begin(Command::new("cat")).await?;
//! target.chat_write(xid, &b"ping\n"[..])?;
//! let line = target.chat_gets(xid, Duration::from_secs(5)).await?;
//! assert_eq!(line, "ping\n");
//! target.chat_close_stdin(xid);
//! target.chat_wait(xid).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Performance
//!
//! - **Zero-copy framing**: payloads are sliced out of the recv buffer as
//!   [`bytes::Bytes`], never copied.
//! - **`io_uring`**: non-blocking I/O via `compio`.
//! - **Sans-IO core**: the wire codec and transaction state machine are
//!   pure and runtime-agnostic.
//!
//! ## Safety
//!
//! All transport and protocol logic is 100% safe Rust.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

// Re-export core types
pub use bytes::Bytes;
pub use twopence_core::config::{ConnectionOptions, TargetDefaults};
pub use twopence_core::environment::Environment;
pub use twopence_core::error::{Result, TwopenceError};
pub use twopence_protocol::{Command, FileTransfer, Status, TransferDirection};

pub mod plugins;
pub mod target;

pub use plugins::PluginId;
pub use target::Target;

/// Development helpers (benches/tests)
pub mod dev_tracing;

/// Convenient glue for callers that just want to connect and drive a
/// target.
pub mod prelude {
    pub use crate::target::Target;
    pub use crate::{Command, Environment, FileTransfer, Result, Status, TransferDirection, TwopenceError};
    pub use bytes::Bytes;
}
