//! The sensor-data ring: a bounded circular collection of daily records
//! with an explicit full flag.
//!
//! `head` is the next slot to write. `head == tail` means *empty*
//! unless the full flag is set — the flag is the disambiguator for the
//! classic head/tail collision and is mirrored into device-info so it
//! survives a cold boot. Reads are LIFO: `read_latest` returns the
//! newest entry, and the acknowledge step pops it by stepping `head`
//! back one slot.

use log::info;

use super::backend::NvmBackend;
use super::store::{SectionStore, MAX_ENTRY_LEN};
use super::NvmError;

/// Entry types storable in a ring section.
pub trait RingEntry: Sized {
    /// Serialize the payload (trailing checksum excluded); returns the
    /// byte count.
    fn encode_entry(&self, buf: &mut [u8]) -> usize;
    fn decode_entry(buf: &[u8]) -> Option<Self>;
}

impl RingEntry for crate::telemetry::DailyRecord {
    fn encode_entry(&self, buf: &mut [u8]) -> usize {
        self.encode(buf)
    }

    fn decode_entry(buf: &[u8]) -> Option<Self> {
        Self::decode(buf)
    }
}

impl RingEntry for crate::telemetry::CloudRecord {
    fn encode_entry(&self, buf: &mut [u8]) -> usize {
        self.encode(buf)
    }

    fn decode_entry(buf: &[u8]) -> Option<Self> {
        Self::decode(buf)
    }
}

/// Ring bookkeeping over one array section of a [`SectionStore`].
///
/// Owns the runtime full flag; the caller persists flag changes into
/// device-info (the store itself has no notion of it).
pub struct SensorDataRing {
    section: usize,
    capacity: u16,
    full: bool,
}

/// What a ring mutation did to the persisted full flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullFlagChange {
    Unchanged,
    /// Mirror `true` into device-info.
    BecameFull,
    /// Mirror `false` into device-info.
    Cleared,
}

impl SensorDataRing {
    /// `full_at_boot` comes from the device-info mirror.
    pub fn new(section: usize, capacity: u16, full_at_boot: bool) -> Self {
        Self {
            section,
            capacity,
            full: full_at_boot,
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Number of valid entries, full flag taken into account.
    pub fn len<B: NvmBackend>(&self, store: &mut SectionStore<B>) -> Result<u16, NvmError> {
        if self.full {
            return Ok(self.capacity);
        }
        store.entry_count(self.section)
    }

    pub fn is_empty<B: NvmBackend>(&self, store: &mut SectionStore<B>) -> Result<bool, NvmError> {
        Ok(self.len(store)? == 0)
    }

    /// Append a record; when the ring was already full the oldest entry
    /// is overwritten. Reports whether the full flag changed so the
    /// caller can mirror it.
    pub fn push<B: NvmBackend, E: RingEntry>(
        &mut self,
        store: &mut SectionStore<B>,
        entry: &E,
    ) -> Result<FullFlagChange, NvmError> {
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let n = entry.encode_entry(&mut buf);
        let now_full = store.append(self.section, &buf[..n], self.full)?;

        if now_full && !self.full {
            info!("sensor-data ring full");
            self.full = true;
            return Ok(FullFlagChange::BecameFull);
        }
        Ok(FullFlagChange::Unchanged)
    }

    /// Read the newest entry — the one at `(head − 1) mod capacity` —
    /// without consuming it.
    pub fn read_latest<B: NvmBackend, E: RingEntry>(
        &self,
        store: &mut SectionStore<B>,
    ) -> Result<E, NvmError> {
        if self.len(store)? == 0 {
            return Err(NvmError::RingEmpty);
        }
        let hdr = store.read_header(self.section)?;
        let newest = (u16::from(hdr.head) + self.capacity - 1) % self.capacity;
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let n = store.read_entry(self.section, newest, &mut buf)?;
        E::decode_entry(&buf[..n]).ok_or(NvmError::CorruptEntry)
    }

    /// Acknowledge the transmitted entry: pop it and clear the full
    /// flag if it was set.
    pub fn increment_tail<B: NvmBackend>(
        &mut self,
        store: &mut SectionStore<B>,
    ) -> Result<FullFlagChange, NvmError> {
        if self.len(store)? == 0 {
            return Err(NvmError::RingEmpty);
        }
        store.pop_head(self.section)?;
        if self.full {
            self.full = false;
            return Ok(FullFlagChange::Cleared);
        }
        Ok(FullFlagChange::Unchanged)
    }

    /// Forget the in-memory full flag after the section was defaulted.
    pub fn reset(&mut self) {
        self.full = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::backend::MemBackend;
    use crate::nvm::section::{AddrWidth, SectionDescriptor, SectionMap};

    /// Minimal fixed-size test entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Rec(u8);

    impl RingEntry for Rec {
        fn encode_entry(&self, buf: &mut [u8]) -> usize {
            buf[..4].copy_from_slice(&[self.0; 4]);
            4
        }

        fn decode_entry(buf: &[u8]) -> Option<Self> {
            Some(Self(buf[0]))
        }
    }

    fn ring_fixture() -> (SectionStore<MemBackend>, SensorDataRing) {
        let map = SectionMap {
            sections: vec![SectionDescriptor {
                tag: 0,
                start: 0x0000,
                end: 0x00EF,
                is_array: true,
                entry_len: 5,
                capacity: 4,
                default_count: 0,
                defaults: vec![],
            }],
            addr_width: AddrWidth::U16,
            magic_addr: 0x00FC,
            magic: vec![0xA5, 0x5A, 0xFE, 0x00],
        };
        let mut store = SectionStore::new(MemBackend::new(0x100), map).unwrap();
        store.init().unwrap();
        (store, SensorDataRing::new(0, 4, false))
    }

    #[test]
    fn fill_and_overwrite_then_drain_in_lifo_order() {
        // Capacity 4, write {1,2,3,4,5}: the fifth write overwrites.
        let (mut store, mut ring) = ring_fixture();

        for v in 1..=4u8 {
            ring.push(&mut store, &Rec(v)).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.len(&mut store).unwrap(), 4);

        // 5th write overwrites the oldest.
        ring.push(&mut store, &Rec(5)).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.len(&mut store).unwrap(), 4);

        // Drain newest-first: 5, 4, 3, 2.
        for expect in [5u8, 4, 3, 2] {
            let rec: Rec = ring.read_latest(&mut store).unwrap();
            assert_eq!(rec.0, expect);
            ring.increment_tail(&mut store).unwrap();
        }

        assert_eq!(ring.len(&mut store).unwrap(), 0);
        assert!(!ring.is_full());
        assert!(matches!(
            ring.read_latest::<_, Rec>(&mut store),
            Err(NvmError::RingEmpty)
        ));
    }

    #[test]
    fn full_flag_changes_are_reported_for_mirroring() {
        let (mut store, mut ring) = ring_fixture();

        for v in 1..=3u8 {
            assert_eq!(ring.push(&mut store, &Rec(v)).unwrap(), FullFlagChange::Unchanged);
        }
        assert_eq!(ring.push(&mut store, &Rec(4)).unwrap(), FullFlagChange::BecameFull);
        // Staying full while overwriting is not a change.
        assert_eq!(ring.push(&mut store, &Rec(5)).unwrap(), FullFlagChange::Unchanged);

        assert_eq!(ring.increment_tail(&mut store).unwrap(), FullFlagChange::Cleared);
        assert_eq!(ring.increment_tail(&mut store).unwrap(), FullFlagChange::Unchanged);
    }

    #[test]
    fn full_flag_survives_reboot_via_constructor() {
        let (mut store, mut ring) = ring_fixture();
        for v in 1..=4u8 {
            ring.push(&mut store, &Rec(v)).unwrap();
        }
        assert!(ring.is_full());

        // head == tail on disk; without the mirror this would read empty.
        let rebooted = SensorDataRing::new(0, 4, true);
        assert_eq!(rebooted.len(&mut store).unwrap(), 4);

        let cold_without_mirror = SensorDataRing::new(0, 4, false);
        assert_eq!(cold_without_mirror.len(&mut store).unwrap(), 0);
    }

    #[test]
    fn count_stays_within_bounds_across_mixed_operations() {
        let (mut store, mut ring) = ring_fixture();
        for round in 0..3 {
            for v in 0..=5u8 {
                ring.push(&mut store, &Rec(v)).unwrap();
                let len = ring.len(&mut store).unwrap();
                assert!(len <= 4, "count {len} exceeded capacity in round {round}");
            }
            while ring.len(&mut store).unwrap() > 0 {
                ring.increment_tail(&mut store).unwrap();
            }
        }
    }
}
