//! Platform-specific bindings.
//!
//! The readiness reactor is specified over an abstract selector: register
//! a file descriptor with a token and an interest set, wait for events,
//! wake the waiter from another thread. Each supported platform provides
//! the same module surface:
//!
//! * `Selector` with `register`, `reregister`, `deregister` and `select`,
//! * `Event`/`Events` plus the `event` accessor module,
//! * `WakerInternal`, the selector-wakeup primitive,
//! * vectored read/write and address-resolution wrappers in `net`.

mod unix;
pub(crate) use unix::*;
