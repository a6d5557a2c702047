//! Socket layer: poll threads and L2CAP socket slots.
//!
//! ```text
//! app ──fd── [socketpair] ──our fd── PollThread ──signaled──┐
//!                                                          ▼
//!                         core stack ◄──requests── L2capSockets
//!                                    ──StackEvent──►
//! ```
//!
//! - `thread`: pool of poll threads, each multiplexing a bounded fd set
//! - `l2cap`: slot table bridging stack channels to app sockets
//! - `stack`: request trait and event type for the core stack
//! - `handoff`: raw socket syscalls (nonblocking I/O, SCM_RIGHTS)

mod error;
pub mod handoff;
pub mod l2cap;
pub mod stack;
pub mod thread;

pub use error::SockError;
pub use handoff::{CONNECT_SIGNAL_SIZE, ConnectSignal};
pub use l2cap::{L2capSockets, SlotSnapshot};
pub use stack::{L2capStack, StackError, StackEvent, WriteStatus};
pub use thread::{PollCommand, PollEvent, PollFlags, PollThreadPool};
