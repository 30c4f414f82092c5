//! # IPC primitives
//!
//! - [`pipe`]: full-duplex ordered message channels carrying strings or
//!   descriptors.
//! - [`ring`]: user buffers the kernel copies received strings into.
//! - [`server`]: connect/accept rendezvous producing a fresh pipe.
//!
//! Each primitive completes operations by raising events on the submitter's
//! hub, always after its own lock is released.

pub mod pipe;
pub mod ring;
pub mod server;

pub use pipe::{Filter, Message, Payload, PipeEndpoint, RecvTarget, create_full_pipe};
pub use ring::RingBuffer;
pub use server::{ClientEndpoint, ServerEndpoint, create_server};
