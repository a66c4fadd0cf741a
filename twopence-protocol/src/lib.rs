//! # twopence-protocol
//!
//! **Wire protocol and transaction-multiplexing engine for twopence.**
//!
//! This crate implements the framed, transaction-multiplexed protocol a
//! twopence controller speaks to whatever is on the other end of a
//! transport byte-pipe: one fixed 8-byte frame header, a handful of packet
//! types (`COMMAND`, `CHAN_DATA`, `CHAN_EOF`, `MAJOR`, `MINOR`, `TIMEOUT`,
//! `INTERRUPT`, `INJECT`, `EXTRACT`, `QUIT`), and an arena of concurrently
//! in-flight transactions, each multiplexing its own set of named
//! channels over the one shared connection.
//!
//! For application development, use the `twopence` crate, which wraps a
//! [`Connection`](connection::Connection) in a target façade with a
//! `<plugin>:<spec>` addressing scheme and per-plugin transport setup.
//!
//! ## Features
//!
//! - **Zero-copy framing**: payloads are sliced out of the recv buffer as
//!   [`bytes::Bytes`], never copied.
//! - **`io_uring`**: non-blocking I/O via `compio`.
//! - **Sans-IO core**: [`Transaction`](transaction::Transaction) and the
//!   codec are pure state machines, independently testable without a
//!   socket.
//! - **Index-based transaction arena**: no intrusive linked list, no
//!   unsafe pointer juggling.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_async)]
#![allow(clippy::let_underscore_future)]
#![allow(clippy::future_not_send)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::while_let_loop)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::never_loop)]

pub mod channel;
pub mod codec;
pub mod command;
pub mod connection;
pub mod transaction;
pub mod xfer;

pub use channel::TransactionChannel;
pub use codec::{Frame, FrameDecoder, PacketType, ProtocolError};
pub use command::Command;
pub use connection::{Completion, Connection};
pub use transaction::{Outcome, Status, TraceSink, Transaction, TransactionKind};
pub use xfer::{FileTransfer, TransferDirection};

/// Prelude module for convenient imports.
///
/// ```rust
/// use twopence_protocol::prelude::*;
/// ```
pub mod prelude {
    pub use super::channel::TransactionChannel;
    pub use super::codec::{Frame, PacketType};
    pub use super::command::Command;
    pub use super::connection::{Completion, Connection};
    pub use super::transaction::{Outcome, Status, Transaction, TransactionKind};
    pub use super::xfer::{FileTransfer, TransferDirection};
    pub use bytes::Bytes;
}
