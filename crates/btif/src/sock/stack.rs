//! Boundary to the core stack's connection-oriented channel API.
//!
//! Requests are plain calls on [`L2capStack`]. Their outcomes come back later as
//! [`StackEvent`]s fed to `L2capSockets::on_stack_event`, each tagged with the correlation id
//! the request was issued with. That is a slot's stack id, which an accept hands over from the
//! listener to the new connection.
//!
//! Requests are issued while the slot table lock is held. Implementations must not deliver
//! events synchronously from inside a request; queue them and deliver from another call
//! stack.

use bytes::Bytes;

use crate::ids::{SdpHandle, SlotId, StackHandle};
use crate::types::{BtStatus, RawAddress, SecurityMask, Uuid};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("stack out of resources")]
    NoResources,

    #[error("unknown stack handle {0}")]
    UnknownHandle(StackHandle),

    #[error("stack request failed: {0}")]
    Failed(String),
}

/// Result of handing outbound data to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Accepted; more data may follow.
    Sent,
    /// Accepted, but the channel is congested. Hold further data until a
    /// `Congestion { congested: false }` event.
    Congested,
}

pub trait L2capStack: Send + Sync {
    /// Reserve an SDP record for a listening slot. Answered by `SdpRecordCreated`.
    fn create_sdp_record(&self, id: SlotId, name: &str, uuid: Uuid) -> Result<(), StackError>;

    fn remove_sdp_record(&self, record: SdpHandle);

    /// Start listening. `psm == 0` asks the stack to assign one. Answered by `ServerStarted`.
    fn start_server(&self, id: SlotId, psm: u16, security: SecurityMask) -> Result<(), StackError>;

    fn stop_server(&self, handle: StackHandle);

    /// Open a channel to `addr`. Answered by `ClientInit` and then `Open`.
    fn connect(
        &self,
        id: SlotId,
        psm: u16,
        security: SecurityMask,
        addr: RawAddress,
    ) -> Result<(), StackError>;

    /// Resolve `uuid` on `addr` to a PSM. Answered by `DiscoveryComplete`.
    fn discover(&self, id: SlotId, addr: RawAddress, uuid: Uuid) -> Result<(), StackError>;

    fn write(&self, handle: StackHandle, id: SlotId, data: Bytes) -> Result<WriteStatus, StackError>;

    fn close(&self, handle: StackHandle);
}

/// Asynchronous stack notifications. `id` is the correlation id the request was issued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    SdpRecordCreated {
        id: SlotId,
        record: SdpHandle,
    },
    ServerStarted {
        id: SlotId,
        status: BtStatus,
        handle: StackHandle,
        psm: u16,
    },
    ClientInit {
        id: SlotId,
        status: BtStatus,
        handle: StackHandle,
    },
    /// Outgoing connection opened (or failed).
    Open {
        id: SlotId,
        status: BtStatus,
        handle: StackHandle,
        addr: RawAddress,
        tx_mtu: u16,
    },
    /// A remote device connected to the listening slot `id` on its listen handle.
    IncomingOpen {
        id: SlotId,
        handle: StackHandle,
        addr: RawAddress,
        tx_mtu: u16,
    },
    Closed {
        id: SlotId,
    },
    Congestion {
        id: SlotId,
        congested: bool,
    },
    Data {
        id: SlotId,
        data: Bytes,
    },
    DiscoveryComplete {
        id: SlotId,
        status: BtStatus,
        psm: u16,
    },
}

impl StackEvent {
    pub fn id(&self) -> SlotId {
        match self {
            StackEvent::SdpRecordCreated { id, .. }
            | StackEvent::ServerStarted { id, .. }
            | StackEvent::ClientInit { id, .. }
            | StackEvent::Open { id, .. }
            | StackEvent::IncomingOpen { id, .. }
            | StackEvent::Closed { id }
            | StackEvent::Congestion { id, .. }
            | StackEvent::Data { id, .. }
            | StackEvent::DiscoveryComplete { id, .. } => *id,
        }
    }
}
