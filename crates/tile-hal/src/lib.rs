//! HAL transport for the Tilewarden control loop.
//!
//! Both ends of the newline-delimited JSON link: the simulator-side
//! [`HalServer`] (snapshot broadcast, fault injection, command execution) and
//! the host-side [`HalAdapter`] (supervised reconnecting client) with the
//! [`CommandSender`] that correlates `cmd_reconfigure` requests to their
//! `cmd_result` completions.

#![forbid(unsafe_code)]

mod adapter;
mod error;
mod queue;
mod sender;
mod server;

pub use adapter::{HalAdapter, HalAdapterConfig};
pub use error::{HalError, HalResult};
pub use queue::InboundQueue;
pub use sender::{CommandReply, CommandSender, Expect};
pub use server::{HalServer, HalServerConfig};
