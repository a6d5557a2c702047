//! Shared HAL-facing types: device addresses, status codes, socket types and flags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use uuid::Uuid;

/// Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805F9B34FB`).
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into a full 128-bit service UUID.
pub fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// 48-bit device address, most significant byte first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawAddress {
    pub address: [u8; 6],
}

impl RawAddress {
    pub const fn new(address: [u8; 6]) -> Self {
        Self { address }
    }

    pub const fn empty() -> Self {
        Self { address: [0; 6] }
    }

    pub fn is_empty(&self) -> bool {
        self.address == [0; 6]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let address: [u8; 6] = bytes.try_into().ok()?;
        Some(Self { address })
    }

    pub fn to_byte_arr(&self) -> [u8; 6] {
        self.address
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device address: {0}")]
pub struct AddressParseError(String);

impl FromStr for RawAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }

        let mut address = [0u8; 6];
        for (byte, part) in address.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }

        Ok(Self { address })
    }
}

/// Status codes returned across the HAL boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BtStatus {
    Success = 0,
    Fail,
    NotReady,
    NoMem,
    Busy,
    Done,
    Unsupported,
    ParmInvalid,
    Unhandled,
    AuthFailure,
    RmtDevDown,
    AuthRejected,
}

impl BtStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BtStatus::Success)
    }
}

impl fmt::Display for BtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Logical socket type. Doubles as the type tag of a poll registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SocketType {
    #[default]
    Unknown = 0,
    Rfcomm = 1,
    Sco = 2,
    L2cap = 3,
    L2capLe = 4,
}

/// Socket flag: no security requirements.
pub const SOCK_FLAG_NONE: i32 = 0;
/// Socket flag: connection must be encrypted.
pub const SOCK_FLAG_ENCRYPT: i32 = 1 << 0;
/// Socket flag: require authentication.
pub const SOCK_FLAG_AUTH: i32 = 1 << 1;
/// Socket flag: don't generate an SDP entry for a listening socket.
pub const SOCK_FLAG_NO_SDP: i32 = 1 << 2;
/// Socket flag: require authentication with MITM protection.
pub const SOCK_FLAG_AUTH_MITM: i32 = 1 << 3;
/// Socket flag: require a 16 digit pin for security mode 2 connections.
pub const SOCK_FLAG_AUTH_16_DIGIT: i32 = 1 << 4;

/// Combination of `SOCK_FLAG_ENCRYPT` and `SOCK_FLAG_AUTH`.
pub const SOCK_META_FLAG_SECURE: i32 = SOCK_FLAG_ENCRYPT | SOCK_FLAG_AUTH;

/// Security requirements handed to the core stack when opening a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityMask(pub u16);

impl SecurityMask {
    pub const NONE: SecurityMask = SecurityMask(0);
    pub const AUTHENTICATE: SecurityMask = SecurityMask(1 << 0);
    pub const ENCRYPT: SecurityMask = SecurityMask(1 << 1);
    pub const MITM: SecurityMask = SecurityMask(1 << 2);
    pub const PIN_16_DIGIT: SecurityMask = SecurityMask(1 << 3);

    /// Translate application socket flags into stack security requirements.
    pub fn from_sock_flags(flags: i32) -> Self {
        let mut mask = 0;
        if flags & SOCK_FLAG_AUTH != 0 {
            mask |= Self::AUTHENTICATE.0;
        }
        if flags & SOCK_FLAG_ENCRYPT != 0 {
            mask |= Self::ENCRYPT.0;
        }
        if flags & SOCK_FLAG_AUTH_MITM != 0 {
            mask |= Self::MITM.0;
        }
        if flags & SOCK_FLAG_AUTH_16_DIGIT != 0 {
            mask |= Self::PIN_16_DIGIT.0;
        }
        SecurityMask(mask)
    }

    pub fn contains(&self, other: SecurityMask) -> bool {
        self.0 & other.0 == other.0
    }
}
