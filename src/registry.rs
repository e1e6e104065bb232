//! Firmware image registry (AM).
//!
//! Two on-flash application slots per processor image; the registry
//! records each slot's operational state and version, plus which slot
//! is currently loaded and which is primary. Persisted as one
//! checksummed record in its own section.

use crate::wire::{Reader, Writer};

/// Health of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OpState {
    #[default]
    Unknown = 0,
    /// Download started but not completed.
    Partial = 1,
    /// Complete and believed bootable.
    Full = 2,
    /// Failed to boot or verify.
    Failed = 3,
}

impl OpState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Partial,
            2 => Self::Full,
            3 => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Slot identity. Stored as a raw byte; anything unexpected reads as
/// `Unknown` and is repaired on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Slot {
    A = 0,
    B = 1,
    #[default]
    Unknown = 0xFF,
}

impl Slot {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::A,
            1 => Self::B,
            _ => Self::Unknown,
        }
    }

    /// The other slot; `Unknown` has no alternate.
    pub fn alternate(self) -> Slot {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
            Self::Unknown => Self::Unknown,
        }
    }
}

/// One slot's registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotInfo {
    pub op_state: OpState,
    pub version: (u32, u32, u32),
}

/// The persisted registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRegistry {
    pub primary: Slot,
    pub loaded: Slot,
    pub slot_a: SlotInfo,
    pub slot_b: SlotInfo,
}

impl ImageRegistry {
    /// Payload length, trailing checksum excluded.
    pub const ENCODED_LEN: usize = 28;
    pub const ENTRY_LEN: usize = Self::ENCODED_LEN + 1;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        w.put_u8(self.primary as u8);
        w.put_u8(self.loaded as u8);
        w.put_u8(self.slot_a.op_state as u8);
        w.put_u32(self.slot_a.version.0);
        w.put_u32(self.slot_a.version.1);
        w.put_u32(self.slot_a.version.2);
        w.put_u8(self.slot_b.op_state as u8);
        w.put_u32(self.slot_b.version.0);
        w.put_u32(self.slot_b.version.1);
        w.put_u32(self.slot_b.version.2);
        debug_assert_eq!(w.pos(), Self::ENCODED_LEN);
        w.pos()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut r = Reader::new(buf);
        Some(Self {
            primary: Slot::from_u8(r.take_u8()),
            loaded: Slot::from_u8(r.take_u8()),
            slot_a: SlotInfo {
                op_state: OpState::from_u8(r.take_u8()),
                version: (r.take_u32(), r.take_u32(), r.take_u32()),
            },
            slot_b: SlotInfo {
                op_state: OpState::from_u8(r.take_u8()),
                version: (r.take_u32(), r.take_u32(), r.take_u32()),
            },
        })
    }

    pub fn slot(&self, slot: Slot) -> Option<&SlotInfo> {
        match slot {
            Slot::A => Some(&self.slot_a),
            Slot::B => Some(&self.slot_b),
            Slot::Unknown => None,
        }
    }

    pub fn slot_mut(&mut self, slot: Slot) -> Option<&mut SlotInfo> {
        match slot {
            Slot::A => Some(&mut self.slot_a),
            Slot::B => Some(&mut self.slot_b),
            Slot::Unknown => None,
        }
    }

    /// Which slot holds exactly this version, if either.
    pub fn slot_with_version(&self, version: (u32, u32, u32)) -> Slot {
        if self.slot_a.version == version {
            Slot::A
        } else if self.slot_b.version == version {
            Slot::B
        } else {
            Slot::Unknown
        }
    }

    /// The currently loaded image's registry entry.
    pub fn loaded_info(&self) -> Option<&SlotInfo> {
        self.slot(self.loaded)
    }
}
