//! Client-side Transport
//!
//! Connections from a process to a named [`Service`](crate::service::Service),
//! all speaking the frame format in [`frame`].
//!
//! - [`IpcSocket`]: blocking, one message at a time
//! - [`AsyncSocket`]: queued sends flushed under a deadline
//! - [`exchange`]: one request, one reply, one deadline

pub mod async_socket;
pub mod exchange;
pub mod frame;
pub mod socket;

pub use async_socket::{AsyncSocket, FlushStatus};
pub use exchange::exchange;
pub use frame::{FrameDecoder, HEADER_SIZE, MAX_FRAME_SIZE};
pub use socket::IpcSocket;
