use std::io;

use crate::ids::{PollHandle, SlotId};
use crate::sock::stack::StackError;
use crate::types::BtStatus;

#[derive(Debug, thiserror::Error)]
pub enum SockError {
    #[error("no free poll thread slot")]
    NoFreeThread,

    #[error("no free socket slot")]
    NoFreeSlot,

    #[error("invalid poll thread handle {0}")]
    InvalidHandle(PollHandle),

    #[error("poll thread {0} is not running")]
    ThreadStopped(PollHandle),

    #[error("unknown socket slot {0}")]
    UnknownSlot(SlotId),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("core stack rejected request: {0}")]
    Stack(#[from] StackError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<&SockError> for BtStatus {
    fn from(err: &SockError) -> Self {
        match err {
            SockError::NoFreeThread | SockError::NoFreeSlot => BtStatus::NoMem,
            SockError::InvalidHandle(_) | SockError::InvalidParam(_) => BtStatus::ParmInvalid,
            SockError::UnknownSlot(_) => BtStatus::ParmInvalid,
            SockError::ThreadStopped(_) => BtStatus::NotReady,
            SockError::Stack(_) | SockError::Io(_) => BtStatus::Fail,
        }
    }
}

impl From<SockError> for BtStatus {
    fn from(err: SockError) -> Self {
        BtStatus::from(&err)
    }
}
