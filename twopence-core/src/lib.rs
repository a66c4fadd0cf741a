//! twopence-core
//!
//! Protocol-agnostic building blocks shared by the transaction-multiplexing
//! layer (`twopence-protocol`) and the target façade (`twopence`):
//! - A head/tail/end cursor byte buffer (`buffer`)
//! - The non-blocking transport-socket abstraction (`socket`)
//! - Local I/O streams for sink/source attachment (`iostream`)
//! - The command environment data model (`environment`)
//! - Byte-watermark backpressure (`backpressure`)
//! - Tunables and per-connection options (`config`)
//! - Error types (`error`)
//! - Cancellation-safety (`poison`), timeouts (`timeout`), and a raw
//!   TCP helper (`tcp`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod backpressure;
pub mod buffer;
pub mod config;
pub mod environment;
pub mod error;
pub mod iostream;
pub mod poison;
pub mod socket;
pub mod tcp;
pub mod timeout;

pub mod prelude {
    pub use crate::buffer::ByteBuffer;
    pub use crate::config::{ConnectionOptions, TargetDefaults, MAX_PACKET};
    pub use crate::environment::Environment;
    pub use crate::error::{Result, TwopenceError};
    pub use crate::iostream::IoStream;
    pub use crate::poison::PoisonGuard;
    pub use crate::socket::{AsyncEndpoint, TransportAddr};
}
