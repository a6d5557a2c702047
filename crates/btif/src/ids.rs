//! Typed correlation ids.
//!
//! Every id that crosses the core stack boundary or the poll thread boundary gets its own
//! newtype so a slot id can never be handed to an API expecting a stack handle or a poll
//! thread handle. Socket slot ids additionally encode which table they belong to: each
//! table owns a disjoint range of the id space.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Socket table that owns a slot id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SockTable {
    Rfcomm,
    L2cap,
}

impl SockTable {
    /// Number of ids reserved for each table.
    pub const SPAN: u32 = 0x1000;

    pub const fn base(self) -> u32 {
        match self {
            SockTable::Rfcomm => 0x1000,
            SockTable::L2cap => 0x2000,
        }
    }

    fn of(raw: u32) -> Option<Self> {
        [SockTable::Rfcomm, SockTable::L2cap]
            .into_iter()
            .find(|table| (table.base()..table.base() + Self::SPAN).contains(&raw))
    }
}

/// Identity of a socket slot, round-tripped through the stack and the poll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SlotId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("slot id {0:#x} is outside every socket table")]
pub struct InvalidSlotId(pub u32);

impl SlotId {
    /// Id of the `index`-th slot of `table`. `None` if the index overflows the table's range.
    pub fn new(table: SockTable, index: usize) -> Option<Self> {
        let index = u32::try_from(index).ok()?;
        if index >= SockTable::SPAN {
            return None;
        }
        Some(Self(table.base() + index))
    }

    /// Reconstruct an id from its raw value, rejecting values outside every table.
    pub fn from_raw(raw: u32) -> Option<Self> {
        SockTable::of(raw).map(|_| Self(raw))
    }

    pub fn table(&self) -> SockTable {
        // Construction guarantees the raw value lies in some table.
        SockTable::of(self.0).unwrap_or(SockTable::L2cap)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for SlotId {
    type Error = InvalidSlotId;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::from_raw(raw).ok_or(InvalidSlotId(raw))
    }
}

impl From<SlotId> for u32 {
    fn from(id: SlotId) -> u32 {
        id.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Handle of a poll thread inside a `PollThreadPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollHandle(usize);

impl PollHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll-{}", self.0)
    }
}

/// Channel handle issued by the core stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackHandle(pub u32);

impl fmt::Display for StackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SDP record handle issued by the core stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SdpHandle(pub u32);

impl fmt::Display for SdpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ticket identifying one admission queue node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueTicket(pub(crate) u64);

impl fmt::Display for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
