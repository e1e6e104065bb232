//! The AM memory map: sectioned NAND layout, cached device info, cloud
//! record LIFO, and the image registry.

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::nvm::{
    AddrWidth, FullFlagChange, NvmBackend, NvmError, SectionDescriptor, SectionMap, SectionStore,
    SensorDataRing,
};
use crate::registry::ImageRegistry;
use crate::telemetry::{CloudRecord, ResetState, MAX_SENSOR_DATA_LOGS};
use crate::wire::{Reader, Writer};

pub const AM_SECT_DEVICE_INFO: usize = 0;
pub const AM_SECT_DATA: usize = 1;
pub const AM_SECT_IMAGE_REGISTRY: usize = 2;
pub const AM_SECT_AM_APP_A: usize = 3;
pub const AM_SECT_SSM_APP_A: usize = 4;
pub const AM_SECT_AM_APP_B: usize = 5;
pub const AM_SECT_SSM_APP_B: usize = 6;

const AM_NVM_VERSION: u16 = 1;
/// Mutex acquisition deadline around the flash read-modify-write.
const LOCK_DEADLINE: Duration = Duration::from_secs(6);
/// Message numbers wrap from 2³²−1 back to 1, never 0.
const MIN_MSG_NUMBER: u32 = 1;

/// AM-side device info (single record, checksummed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmDeviceInfo {
    pub nvm_version: u16,
    pub first_act_date: u32,
    pub recent_act_date: u32,
    pub recent_deact_date: u32,
    pub num_act: u8,
    pub num_deact: u8,
    pub am_wake_rate_days: u16,
    pub stroke_detection_on: bool,
    pub reset_state: ResetState,
    pub msg_number: u32,
    pub unexpected_reset_counter: u32,
    pub time_of_last_unexpected_reset: u32,
    pub sensor_data_buffer_full: bool,
}

impl Default for AmDeviceInfo {
    fn default() -> Self {
        Self {
            nvm_version: AM_NVM_VERSION,
            first_act_date: 0,
            recent_act_date: 0,
            recent_deact_date: 0,
            num_act: 0,
            num_deact: 0,
            am_wake_rate_days: 1,
            stroke_detection_on: false,
            reset_state: ResetState::Por,
            msg_number: MIN_MSG_NUMBER,
            unexpected_reset_counter: 0,
            time_of_last_unexpected_reset: 0,
            sensor_data_buffer_full: false,
        }
    }
}

impl AmDeviceInfo {
    pub const ENCODED_LEN: usize = 33;
    pub const ENTRY_LEN: usize = Self::ENCODED_LEN + 1;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        w.put_u16(self.nvm_version);
        w.put_u32(self.first_act_date);
        w.put_u32(self.recent_act_date);
        w.put_u32(self.recent_deact_date);
        w.put_u8(self.num_act);
        w.put_u8(self.num_deact);
        w.put_u16(self.am_wake_rate_days);
        w.put_bool(self.stroke_detection_on);
        w.put_u8(self.reset_state as u8);
        w.put_u32(self.msg_number);
        w.put_u32(self.unexpected_reset_counter);
        w.put_u32(self.time_of_last_unexpected_reset);
        w.put_bool(self.sensor_data_buffer_full);
        debug_assert_eq!(w.pos(), Self::ENCODED_LEN);
        w.pos()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut r = Reader::new(buf);
        Some(Self {
            nvm_version: r.take_u16(),
            first_act_date: r.take_u32(),
            recent_act_date: r.take_u32(),
            recent_deact_date: r.take_u32(),
            num_act: r.take_u8(),
            num_deact: r.take_u8(),
            am_wake_rate_days: r.take_u16(),
            stroke_detection_on: r.take_bool(),
            reset_state: ResetState::from_u8(r.take_u8()),
            msg_number: r.take_u32(),
            unexpected_reset_counter: r.take_u32(),
            time_of_last_unexpected_reset: r.take_u32(),
            sensor_data_buffer_full: r.take_bool(),
        })
    }
}

/// The AM NAND layout. Firmware slots are raw reservations (entry_len
/// 0); the store leaves their contents to the flash loader.
pub fn am_map() -> SectionMap {
    let mut defaults = vec![0u8; AmDeviceInfo::ENCODED_LEN];
    AmDeviceInfo::default().encode(&mut defaults);
    let mut registry_defaults = vec![0u8; ImageRegistry::ENCODED_LEN];
    ImageRegistry::default().encode(&mut registry_defaults);

    let hdr = AddrWidth::U32.header_len();
    let data_start: u32 = 0x0100;
    let data_end =
        data_start + hdr + MAX_SENSOR_DATA_LOGS as u32 * CloudRecord::ENTRY_LEN as u32 - 1;

    SectionMap {
        sections: vec![
            SectionDescriptor {
                tag: AM_SECT_DEVICE_INFO as u8,
                start: 0x0000,
                end: 0x00FF,
                is_array: false,
                entry_len: AmDeviceInfo::ENTRY_LEN as u16,
                capacity: 0,
                default_count: 1,
                defaults,
            },
            SectionDescriptor {
                tag: AM_SECT_DATA as u8,
                start: data_start,
                end: data_end,
                is_array: true,
                entry_len: CloudRecord::ENTRY_LEN as u16,
                capacity: MAX_SENSOR_DATA_LOGS as u16,
                default_count: 0,
                defaults: vec![],
            },
            SectionDescriptor {
                tag: AM_SECT_IMAGE_REGISTRY as u8,
                start: 0x0000_6000,
                end: 0x0000_60FF,
                is_array: false,
                entry_len: ImageRegistry::ENTRY_LEN as u16,
                capacity: 0,
                default_count: 1,
                defaults: registry_defaults,
            },
            SectionDescriptor {
                tag: AM_SECT_AM_APP_A as u8,
                start: 0x0010_0000,
                end: 0x001F_FFFF,
                is_array: false,
                entry_len: 0,
                capacity: 0,
                default_count: 0,
                defaults: vec![],
            },
            SectionDescriptor {
                tag: AM_SECT_SSM_APP_A as u8,
                start: 0x0020_0000,
                end: 0x002F_FFFF,
                is_array: false,
                entry_len: 0,
                capacity: 0,
                default_count: 0,
                defaults: vec![],
            },
            SectionDescriptor {
                tag: AM_SECT_AM_APP_B as u8,
                start: 0x0030_0000,
                end: 0x003F_FFFF,
                is_array: false,
                entry_len: 0,
                capacity: 0,
                default_count: 0,
                defaults: vec![],
            },
            SectionDescriptor {
                tag: AM_SECT_SSM_APP_B as u8,
                start: 0x0040_0000,
                end: 0x004F_FFFF,
                is_array: false,
                entry_len: 0,
                capacity: 0,
                default_count: 0,
                defaults: vec![],
            },
        ],
        addr_width: AddrWidth::U32,
        magic_addr: 0x007F_FFFC,
        magic: 0xABCD_EABC_u32.to_le_bytes().to_vec(),
    }
}

/// The AM's view of flash, shared between the telemetry task and the
/// firmware-update task. Every reader that computes from the in-memory
/// image takes the lock before the underlying NAND access; acquisition
/// failure surfaces as an error, never a partial write.
pub struct AmMemoryMap<B: NvmBackend> {
    store: Mutex<SectionStore<B>>,
    ring: Mutex<SensorDataRing>,
    info: Mutex<AmDeviceInfo>,
    registry: Mutex<ImageRegistry>,
}

impl<B: NvmBackend> AmMemoryMap<B> {
    /// Validate flash, load (or default) the cached records.
    pub fn init(backend: B) -> Result<Self, NvmError> {
        let mut store = SectionStore::new(backend, am_map())?;
        store.init()?;

        let mut buf = [0u8; crate::nvm::store::MAX_ENTRY_LEN];

        let info = store
            .read_current_entry(AM_SECT_DEVICE_INFO, &mut buf)
            .ok()
            .and_then(|n| AmDeviceInfo::decode(&buf[..n]))
            .filter(|info| info.nvm_version == AM_NVM_VERSION)
            .unwrap_or_else(|| {
                warn!("am memmap: device info invalid, using defaults");
                let _ = store.default_section(AM_SECT_DEVICE_INFO);
                AmDeviceInfo::default()
            });

        let registry = store
            .read_current_entry(AM_SECT_IMAGE_REGISTRY, &mut buf)
            .ok()
            .and_then(|n| ImageRegistry::decode(&buf[..n]))
            .unwrap_or_else(|| {
                warn!("am memmap: image registry invalid, using defaults");
                let _ = store.default_section(AM_SECT_IMAGE_REGISTRY);
                ImageRegistry::default()
            });

        let ring = SensorDataRing::new(
            AM_SECT_DATA,
            MAX_SENSOR_DATA_LOGS as u16,
            info.sensor_data_buffer_full,
        );

        let hdr = store.read_header(AM_SECT_DATA)?;
        info!("am memmap: initialized, ring head {} tail {}", hdr.head, hdr.tail);

        Ok(Self {
            store: Mutex::new(store),
            ring: Mutex::new(ring),
            info: Mutex::new(info),
            registry: Mutex::new(registry),
        })
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, SectionStore<B>>, NvmError> {
        let deadline = Instant::now() + LOCK_DEADLINE;
        loop {
            match self.store.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("am memmap: lock deadline exceeded");
                        return Err(NvmError::LockTimeout);
                    }
                    std::thread::yield_now();
                }
                Err(TryLockError::Poisoned(_)) => return Err(NvmError::LockTimeout),
            }
        }
    }

    fn persist_info(&self, store: &mut SectionStore<B>, info: &AmDeviceInfo) -> Result<(), NvmError> {
        let mut buf = [0u8; AmDeviceInfo::ENCODED_LEN];
        let n = info.encode(&mut buf);
        store.write_current(AM_SECT_DEVICE_INFO, &buf[..n])
    }

    // ── Device info ───────────────────────────────────────────

    pub fn device_info(&self) -> AmDeviceInfo {
        *self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn update_info(&self, f: impl FnOnce(&mut AmDeviceInfo)) -> Result<(), NvmError> {
        let mut store = self.lock_store()?;
        let mut info = self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut info);
        self.persist_info(&mut store, &info)
    }

    /// Take the next cloud message number, advancing the persisted
    /// counter. Wraps from 2³²−1 back to 1.
    pub fn next_msg_number(&self) -> Result<u32, NvmError> {
        let mut store = self.lock_store()?;
        let mut info = self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = info.msg_number;
        info.msg_number = if current == u32::MAX {
            MIN_MSG_NUMBER
        } else {
            current + 1
        };
        self.persist_info(&mut store, &info)?;
        Ok(current)
    }

    pub fn increment_unexpected_resets(&self, timestamp: u32) -> Result<(), NvmError> {
        self.update_info(|info| {
            info.unexpected_reset_counter += 1;
            info.time_of_last_unexpected_reset = timestamp;
        })
    }

    // ── Cloud-record LIFO ─────────────────────────────────────

    pub fn stored_records(&self) -> Result<u16, NvmError> {
        let mut store = self.lock_store()?;
        let ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.len(&mut store)
    }

    pub fn write_record(&self, record: &CloudRecord) -> Result<(), NvmError> {
        let mut store = self.lock_store()?;
        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match ring.push(&mut *store, record)? {
            FullFlagChange::BecameFull => {
                let mut info = self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                info.sensor_data_buffer_full = true;
                self.persist_info(&mut store, &info)
            }
            _ => Ok(()),
        }
    }

    /// Newest stored record, for transmission.
    pub fn read_latest_record(&self) -> Result<CloudRecord, NvmError> {
        let mut store = self.lock_store()?;
        let ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.read_latest(&mut store)
    }

    /// Pop the transmitted record after the cloud acknowledged it.
    pub fn record_sent(&self) -> Result<(), NvmError> {
        let mut store = self.lock_store()?;
        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match ring.increment_tail(&mut *store)? {
            FullFlagChange::Cleared => {
                let mut info = self.info.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                info.sensor_data_buffer_full = false;
                self.persist_info(&mut store, &info)
            }
            _ => Ok(()),
        }
    }

    // ── Image registry ────────────────────────────────────────

    pub fn registry(&self) -> ImageRegistry {
        *self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn update_registry(&self, f: impl FnOnce(&mut ImageRegistry)) -> Result<(), NvmError> {
        let mut store = self.lock_store()?;
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut registry);
        let mut buf = [0u8; ImageRegistry::ENCODED_LEN];
        let n = registry.encode(&mut buf);
        store.write_current(AM_SECT_IMAGE_REGISTRY, &buf[..n])
    }

    /// Release the backing flash device (reboot simulation in tests).
    pub fn into_backend(self) -> B {
        self.store
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .into_backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::nand::NandBackend;
    use crate::registry::{OpState, Slot};

    fn nand() -> NandBackend {
        NandBackend::with_block_size(0x0080_0000, 0x0008_0000)
    }

    fn fresh_map() -> AmMemoryMap<NandBackend> {
        AmMemoryMap::init(nand()).expect("init")
    }

    #[test]
    fn map_layout_is_valid() {
        assert!(am_map().validate().is_ok());
    }

    #[test]
    fn msg_number_increments_and_wraps_to_one() {
        let map = fresh_map();
        assert_eq!(map.next_msg_number().unwrap(), 1);
        assert_eq!(map.next_msg_number().unwrap(), 2);

        map.update_info(|info| info.msg_number = u32::MAX).unwrap();
        assert_eq!(map.next_msg_number().unwrap(), u32::MAX);
        assert_eq!(map.next_msg_number().unwrap(), MIN_MSG_NUMBER);
    }

    #[test]
    fn cloud_records_round_trip_with_lifo_ack() {
        let map = fresh_map();
        for n in 1..=3u32 {
            let mut rec = CloudRecord::default();
            rec.msg_number = n;
            map.write_record(&rec).unwrap();
        }
        assert_eq!(map.stored_records().unwrap(), 3);

        assert_eq!(map.read_latest_record().unwrap().msg_number, 3);
        map.record_sent().unwrap();
        assert_eq!(map.read_latest_record().unwrap().msg_number, 2);
        assert_eq!(map.stored_records().unwrap(), 2);
    }

    #[test]
    fn registry_persists_across_reinit() {
        let map = AmMemoryMap::init(nand()).unwrap();
        map.update_registry(|reg| {
            reg.primary = Slot::A;
            reg.loaded = Slot::A;
            reg.slot_a.op_state = OpState::Full;
            reg.slot_a.version = (2, 1, 9);
        })
        .unwrap();
        let backend = map.into_backend();

        let map = AmMemoryMap::init(backend).unwrap();
        let reg = map.registry();
        assert_eq!(reg.primary, Slot::A);
        assert_eq!(reg.slot_a.op_state, OpState::Full);
        assert_eq!(reg.slot_a.version, (2, 1, 9));
    }

    #[test]
    fn device_info_full_flag_mirrors() {
        let map = fresh_map();
        for n in 0..MAX_SENSOR_DATA_LOGS as u32 {
            let mut rec = CloudRecord::default();
            rec.msg_number = n + 1;
            map.write_record(&rec).unwrap();
        }
        assert!(map.device_info().sensor_data_buffer_full);
        map.record_sent().unwrap();
        assert!(!map.device_info().sensor_data_buffer_full);
    }
}
