//! btif: Bluetooth interface adaptation layer.
//!
//! Runtime pieces that sit between the HAL and the core stack:
//! - `sock`: poll thread pool and L2CAP socket slot table (Linux only)
//! - `profile_queue`: serialized admission of outgoing profile connections
//! - `sm`: generic state machine engine for profile state machines
//! - `context`: the btif task that queue jobs run on

pub mod config;
pub mod context;
pub mod ids;
pub mod logging;
pub mod profile_queue;
pub mod sm;
#[cfg(target_os = "linux")]
pub mod sock;
pub mod types;

pub use config::SockConfig;
pub use context::{BtifTask, ContextError};
pub use ids::{InvalidSlotId, PollHandle, QueueTicket, SdpHandle, SlotId, SockTable, StackHandle};
pub use profile_queue::{ConnectCallback, ProfileQueue, QueueError};
pub use sm::{SmError, SmEvent, StateHandler, StateMachine, Transitions};
pub use types::{BtStatus, RawAddress, SocketType, Uuid};
