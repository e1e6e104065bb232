//! Sectioned non-volatile storage.
//!
//! A *section* is a contiguous range of the backing store holding a
//! checksummed header followed by one or more fixed-size entries, each
//! with a trailing checksum byte. The section map is declared
//! address-ordered, and the last section ends before a magic marker at
//! the highest used address. Recovery is checksum-on-read with
//! default-on-failure; there is no journaling.
//!
//! The same discipline runs over the SSM's I2C EEPROM (16-bit
//! addressing) and the AM's SPI NAND (32-bit addressing, block-level
//! writes behind [`backend::NvmBackend`]).

pub mod backend;
pub mod device_info;
pub mod ring;
pub mod section;
pub mod store;

pub use backend::{BackendError, MemBackend, NvmBackend};
pub use device_info::{DeviceInfo, RtcTimeStatus, NVM_VERSION};
pub use ring::{FullFlagChange, SensorDataRing};
pub use section::{AddrWidth, SectionDescriptor, SectionHeader, SectionMap};
pub use store::SectionStore;

use core::fmt;

/// Two's-complement checksum over a byte run, as stored in headers and
/// entry trailers.
pub fn nvm_checksum(bytes: &[u8]) -> u8 {
    crate::wire::checksum(bytes)
}

/// NVM failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmError {
    /// The backing store failed after retries.
    Backend(BackendError),
    /// Section map is malformed (overlap, bad addresses, magic clash).
    BadMap,
    /// A section header failed validation or checksum.
    CorruptHeader,
    /// An entry's trailing checksum did not match.
    CorruptEntry,
    /// The sensor-data ring has no entries to read.
    RingEmpty,
    /// The memory-map mutex could not be taken within its deadline.
    LockTimeout,
}

impl fmt::Display for NvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "backend: {e}"),
            Self::BadMap => write!(f, "bad section map"),
            Self::CorruptHeader => write!(f, "corrupt section header"),
            Self::CorruptEntry => write!(f, "corrupt entry"),
            Self::RingEmpty => write!(f, "ring empty"),
            Self::LockTimeout => write!(f, "memory-map lock timeout"),
        }
    }
}

impl std::error::Error for NvmError {}

impl From<BackendError> for NvmError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

/// Section indices of the SSM EEPROM map.
pub const SSM_SECT_DEVICE_INFO: usize = 0;
pub const SSM_SECT_SENSOR_DATA: usize = 1;

/// Total SSM EEPROM size.
pub const SSM_EEPROM_SIZE: usize = 0x4000;

/// The SSM EEPROM layout: a 128-byte device-info reservation, the
/// 56-entry sensor-data ring, and the magic marker at the top of the
/// part.
pub fn ssm_map() -> SectionMap {
    use crate::telemetry::{DailyRecord, MAX_SENSOR_DATA_LOGS};

    let mut defaults = vec![0u8; DeviceInfo::ENCODED_LEN];
    DeviceInfo::default().encode(&mut defaults);

    let hdr = AddrWidth::U16.header_len();
    let data_start: u32 = 0x0100;
    let data_end =
        data_start + hdr + MAX_SENSOR_DATA_LOGS as u32 * DailyRecord::ENTRY_LEN as u32 - 1;

    SectionMap {
        sections: vec![
            SectionDescriptor {
                tag: SSM_SECT_DEVICE_INFO as u8,
                start: 0x0000,
                end: 0x007F,
                is_array: false,
                entry_len: DeviceInfo::ENTRY_LEN as u16,
                capacity: 0,
                default_count: 1,
                defaults,
            },
            SectionDescriptor {
                tag: SSM_SECT_SENSOR_DATA as u8,
                start: data_start,
                end: data_end,
                is_array: true,
                entry_len: DailyRecord::ENTRY_LEN as u16,
                capacity: MAX_SENSOR_DATA_LOGS as u16,
                default_count: 0,
                defaults: vec![],
            },
        ],
        addr_width: AddrWidth::U16,
        magic_addr: SSM_EEPROM_SIZE as u32 - 4,
        magic: vec![0xA5, 0x5A, 0xFE, 0x00],
    }
}

#[cfg(test)]
mod map_tests {
    use super::*;

    #[test]
    fn ssm_map_is_valid_and_fits_the_part() {
        let map = ssm_map();
        assert!(map.validate().is_ok());
        let last = map.sections.last().unwrap();
        assert!(last.end < map.magic_addr);
        assert_eq!(map.sections[1].capacity, 56);
    }

    #[test]
    fn device_info_fits_its_reservation() {
        let map = ssm_map();
        let sec = &map.sections[0];
        let used = map.header_len() + u32::from(sec.entry_len);
        assert!(sec.start + used - 1 <= sec.end);
    }
}
