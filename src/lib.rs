//! Coroutine-style asynchronous I/O runtime.
//!
//! corio provides an event-driven execution context in which spawned
//! futures perform network I/O, timers, signal waits and DNS resolution
//! without blocking the underlying OS thread. A context owns three pieces
//! of machinery:
//!
//! * a **reactor** multiplexing OS readiness events (epoll on Linux,
//!   kqueue on the BSDs and macOS),
//! * a **scheduler** draining a FIFO of runnable tasks with Asio-style
//!   outstanding-work accounting, and
//! * a set of per-context **services** (timer heap, signal delivery,
//!   name resolution) created on demand.
//!
//! I/O objects ([`net::Socket`], [`net::Acceptor`], [`time::Timer`],
//! [`signal::SignalSet`], [`resolver::Resolver`]) hand out operation
//! futures. Operations never block: they attempt the non-blocking system
//! call when polled and park their task with the reactor on
//! [`WouldBlock`], to be resumed on the owning context once the OS
//! reports readiness.
//!
//! [`WouldBlock`]: std::io::ErrorKind::WouldBlock
//!
//! # Examples
//!
//! An echo round trip over loopback:
//!
//! ```
//! use corio::net::{Acceptor, Socket};
//! use corio::IoContext;
//!
//! # fn main() -> std::io::Result<()> {
//! let ioc = IoContext::new()?;
//! let ex = ioc.executor();
//!
//! let mut acceptor = Acceptor::new(&ioc);
//! acceptor.listen("127.0.0.1:0".parse().unwrap(), 128)?;
//! let addr = acceptor.local_addr()?;
//! let accept_ex = ioc.executor();
//!
//! ex.spawn(async move {
//!     let mut peer = Socket::from_executor(&accept_ex);
//!     acceptor.accept(&mut peer).await.unwrap();
//!     let mut buf = [0; 32];
//!     let n = peer.read_some(&mut buf[..]).await.unwrap();
//!     peer.write_some(&buf[..n]).await.unwrap();
//! })
//! .detach();
//!
//! let ex2 = ex.clone();
//! ex.spawn(async move {
//!     let mut s = Socket::from_executor(&ex2);
//!     s.open().unwrap();
//!     s.connect(addr).await.unwrap();
//!     s.write_some(&b"ping"[..]).await.unwrap();
//!     let mut buf = [0; 4];
//!     s.read_some(&mut buf[..]).await.unwrap();
//!     assert_eq!(&buf, b"ping");
//! })
//! .detach();
//!
//! ioc.run();
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs, missing_debug_implementations)]
#![cfg(unix)]

mod context;
mod error;
mod event;
mod frame;
mod interest;
mod reactor;
mod scheduler;
mod stop;
mod sys;
mod task;
mod token;

pub mod buf;
pub mod net;
pub mod resolver;
pub mod signal;
pub mod stream;
pub mod time;

pub use context::{Executor, IoContext, WorkGuard};
pub use error::{stream_truncated, test_failure, Cond};
pub use stop::{StopSource, StopToken};
pub use task::{run_on, JoinHandle};

pub(crate) use interest::Interest;
pub(crate) use token::Token;
