//! TCP networking primitives.
//!
//! [`Socket`] is a stream socket driven by awaitable operations;
//! [`Acceptor`] listens and accepts connections into caller-provided
//! sockets. Both are I/O objects of one execution context: they hold a
//! context reference and a service-managed implementation, and dropping
//! them cancels whatever is in flight.

mod acceptor;
mod socket;

pub use acceptor::{Accept, Acceptor};
pub use socket::{Connect, ReadSome, Socket, WriteSome};

pub(crate) use socket::{new_tcp_socket, SocketImpl};
