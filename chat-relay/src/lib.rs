//! Line-oriented chat relay with an out-of-band file upload channel.
//!
//! See `README.md` for usage and the wire protocol. Each module owns one
//! concern:
//!
//! - [`message`] is the newline-delimited JSON codec shared by server and
//!   client.
//! - [`session`] runs one connection: a read loop feeding the dispatcher and
//!   a single writer task draining the session's outbox.
//! - [`registry`] maps remote endpoints to live sessions.
//! - [`dispatcher`] is the actor that owns the registry and decides who gets
//!   which frame.
//! - [`transfer`] receives uploads on the file listener.
//! - [`server`] binds both listeners and wires them to the dispatcher.
//! - [`names`] hands out placeholder display names.
//! - [`cli`] and [`client`] are the command-line surface and terminal client.
//!
//! Unit tests live next to the code; `tests/` drives real TCP listeners.

pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod message;
pub mod names;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;
