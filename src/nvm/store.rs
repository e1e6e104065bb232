//! The section store: validation, defaulting, and entry access.

use log::{info, warn};

use super::backend::NvmBackend;
use super::section::{SectionHeader, SectionMap};
use super::{nvm_checksum, NvmError};

/// Largest stored entry across both maps (AM cloud record + checksum).
pub const MAX_ENTRY_LEN: usize = 340;

/// Retries per backing-store operation before the error escalates.
const OP_RETRIES: u32 = 2;

/// Schema-aware store over one backing device.
pub struct SectionStore<B: NvmBackend> {
    backend: B,
    map: SectionMap,
}

impl<B: NvmBackend> SectionStore<B> {
    /// Build a store over `backend`. Fails on a malformed map — layout
    /// bugs must not reach the field.
    pub fn new(backend: B, map: SectionMap) -> Result<Self, NvmError> {
        map.validate()?;
        Ok(Self { backend, map })
    }

    pub fn map(&self) -> &SectionMap {
        &self.map
    }

    /// Release the backing device (teardown, reinit tests).
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Scan for the magic marker; on absence default every section and
    /// write the marker. Then re-validate each section and default any
    /// that fails its header or data checks.
    pub fn init(&mut self) -> Result<(), NvmError> {
        if !self.magic_present()? {
            warn!("NVM: no magic value, defaulting all sections");
            self.default_all()?;
        }

        for idx in 0..self.map.sections.len() {
            // Raw reservations (firmware slots) have no entry structure
            // to validate; their contents belong to the image loader.
            if self.map.sections[idx].entry_len == 0 {
                continue;
            }
            let header_ok = self.check_section_header(idx);
            let data_ok = header_ok && self.check_section_data(idx);
            if !header_ok || !data_ok {
                warn!("NVM: section {} failed validation, defaulting", self.map.sections[idx].tag);
                self.default_section(idx)?;
            } else {
                info!("NVM: section {} check complete", self.map.sections[idx].tag);
            }
        }
        Ok(())
    }

    // ── Header access ─────────────────────────────────────────

    pub fn read_header(&mut self, idx: usize) -> Result<SectionHeader, NvmError> {
        let width = self.map.addr_width;
        let mut buf = [0u8; 10];
        let len = width.header_len() as usize;
        let start = self.map.sections[idx].start;
        self.read_bytes(start, &mut buf[..len])?;
        SectionHeader::decode(width, &buf[..len])
    }

    fn write_header(&mut self, idx: usize, hdr: &SectionHeader) -> Result<(), NvmError> {
        let width = self.map.addr_width;
        let mut buf = [0u8; 10];
        let len = hdr.encode(width, &mut buf);
        let start = self.map.sections[idx].start;
        self.write_bytes(start, &buf[..len])
    }

    // ── Entry access ──────────────────────────────────────────

    /// Read the entry at the header's current address, verifying its
    /// trailing checksum. Returns the payload length (entry minus the
    /// checksum byte) written into `buf`.
    pub fn read_current_entry(&mut self, idx: usize, buf: &mut [u8]) -> Result<usize, NvmError> {
        let hdr = self.read_header(idx)?;
        self.read_entry_raw(idx, hdr.current_addr, buf)
    }

    /// Read the entry in ring slot `slot`, verifying its checksum.
    pub fn read_entry(&mut self, idx: usize, slot: u16, buf: &mut [u8]) -> Result<usize, NvmError> {
        let addr = self.map.entry_addr(idx, slot);
        self.read_entry_raw(idx, addr, buf)
    }

    fn read_entry_raw(&mut self, idx: usize, addr: u32, buf: &mut [u8]) -> Result<usize, NvmError> {
        let entry_len = usize::from(self.map.sections[idx].entry_len);
        let payload_len = entry_len - 1;
        self.read_bytes(addr, &mut buf[..entry_len])?;
        if nvm_checksum(&buf[..payload_len]) != buf[payload_len] {
            return Err(NvmError::CorruptEntry);
        }
        Ok(payload_len)
    }

    /// Overwrite the current entry in place (single-record sections and
    /// re-writes of the newest ring slot). Appends the recomputed
    /// trailing checksum.
    pub fn write_current(&mut self, idx: usize, payload: &[u8]) -> Result<(), NvmError> {
        let hdr = self.read_header(idx)?;
        self.write_entry_raw(hdr.current_addr, payload)
    }

    /// Append to an array section: advance `head` (dragging `tail`
    /// along when the ring was already full), persist the header, then
    /// write the entry into the slot `head` pointed at before the bump.
    ///
    /// Returns true when the ring is full after this write
    /// (`head == tail`).
    pub fn append(&mut self, idx: usize, payload: &[u8], was_full: bool) -> Result<bool, NvmError> {
        let cap = self.map.sections[idx].capacity;
        let mut hdr = self.read_header(idx)?;
        let write_addr = hdr.current_addr;

        if was_full {
            hdr.tail = (hdr.tail + 1) % cap as u8;
        }
        hdr.head = (hdr.head + 1) % cap as u8;
        hdr.current_addr = self.map.entry_addr(idx, u16::from(hdr.head));
        self.write_header(idx, &hdr)?;

        self.write_entry_raw(write_addr, payload)?;

        Ok(hdr.head == hdr.tail)
    }

    /// Pop the newest entry: step `head` back one slot and re-point the
    /// current address at it. The caller owns the full flag.
    pub fn pop_head(&mut self, idx: usize) -> Result<(), NvmError> {
        let cap = self.map.sections[idx].capacity;
        let mut hdr = self.read_header(idx)?;
        hdr.head = (hdr.head + cap as u8 - 1) % cap as u8;
        hdr.current_addr = self.map.entry_addr(idx, u16::from(hdr.head));
        self.write_header(idx, &hdr)
    }

    fn write_entry_raw(&mut self, addr: u32, payload: &[u8]) -> Result<(), NvmError> {
        self.write_bytes(addr, payload)?;
        let cs = nvm_checksum(payload);
        self.write_bytes(addr + payload.len() as u32, &[cs])
    }

    /// Entries currently held by an array section, before the full flag
    /// is taken into account (`head == tail` reads as empty here).
    pub fn entry_count(&mut self, idx: usize) -> Result<u16, NvmError> {
        let cap = self.map.sections[idx].capacity;
        let hdr = self.read_header(idx)?;
        let head = u16::from(hdr.head);
        let tail = u16::from(hdr.tail);
        Ok(if head >= tail { head - tail } else { cap - tail + head })
    }

    // ── Defaulting ────────────────────────────────────────────

    /// Write `default_count` copies of the default payload, then a
    /// fresh valid header.
    pub fn default_section(&mut self, idx: usize) -> Result<(), NvmError> {
        let sec = self.map.sections[idx].clone();
        info!("NVM: defaulting section {}", sec.tag);

        for entry in 0..sec.default_count {
            let addr = self.map.entry_addr(idx, entry);
            self.write_entry_raw(addr, &sec.defaults)?;
        }

        let mut hdr = SectionHeader {
            tag: sec.tag,
            head: sec.default_count as u8,
            tail: sec.default_count as u8,
            entry_len: sec.entry_len,
            current_addr: sec.start + self.map.header_len(),
        };
        if sec.is_array {
            hdr.current_addr = self.map.entry_addr(idx, sec.default_count);
        }
        self.write_header(idx, &hdr)
    }

    pub fn default_all(&mut self) -> Result<(), NvmError> {
        for idx in 0..self.map.sections.len() {
            self.default_section(idx)?;
        }
        self.write_magic()
    }

    // ── Validation ────────────────────────────────────────────

    fn check_section_header(&mut self, idx: usize) -> bool {
        let sec = self.map.sections[idx].clone();
        let hdr = match self.read_header(idx) {
            Ok(hdr) => hdr,
            Err(_) => return false,
        };

        if hdr.tag != sec.tag {
            return false;
        }

        if sec.is_array {
            let after_header = sec.start + self.map.header_len();
            if hdr.current_addr > sec.end || hdr.current_addr < after_header {
                return false;
            }
            if hdr.entry_len != sec.entry_len {
                return false;
            }
            // head and current_addr must agree.
            if hdr.current_addr != self.map.entry_addr(idx, u16::from(hdr.head)) {
                return false;
            }
            true
        } else {
            // Single-record sections just need to be populated.
            hdr.head == 1
        }
    }

    /// Verify the trailing checksum of every live entry.
    fn check_section_data(&mut self, idx: usize) -> bool {
        let sec = self.map.sections[idx].clone();
        let mut buf = [0u8; MAX_ENTRY_LEN];

        if !sec.is_array {
            return self.read_current_entry(idx, &mut buf).is_ok();
        }

        let hdr = match self.read_header(idx) {
            Ok(hdr) => hdr,
            Err(_) => return false,
        };
        let cap = sec.capacity;
        let head = u16::from(hdr.head);
        let mut slot = u16::from(hdr.tail);
        while slot != head {
            if self.read_entry(idx, slot, &mut buf).is_err() {
                return false;
            }
            slot = (slot + 1) % cap;
        }
        true
    }

    fn magic_present(&mut self) -> Result<bool, NvmError> {
        let mut buf = vec![0u8; self.map.magic.len()];
        self.read_bytes(self.map.magic_addr, &mut buf)?;
        Ok(buf == self.map.magic)
    }

    fn write_magic(&mut self) -> Result<(), NvmError> {
        info!("NVM: writing magic value");
        let magic = self.map.magic.clone();
        self.write_bytes(self.map.magic_addr, &magic)
    }

    // ── Retrying byte access ──────────────────────────────────

    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), NvmError> {
        let mut last = None;
        for _ in 0..=OP_RETRIES {
            match self.backend.read(addr, buf) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(NvmError::Backend(last.expect("at least one attempt")))
    }

    fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), NvmError> {
        let mut last = None;
        for _ in 0..=OP_RETRIES {
            match self.backend.write(addr, bytes) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(NvmError::Backend(last.expect("at least one attempt")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::backend::MemBackend;
    use crate::nvm::section::{AddrWidth, SectionDescriptor, SectionMap};

    fn small_map() -> SectionMap {
        SectionMap {
            sections: vec![
                SectionDescriptor {
                    tag: 0,
                    start: 0x0000,
                    end: 0x003F,
                    is_array: false,
                    entry_len: 8,
                    capacity: 0,
                    default_count: 1,
                    defaults: vec![1, 2, 3, 4, 5, 6, 7],
                },
                SectionDescriptor {
                    tag: 1,
                    start: 0x0040,
                    end: 0x00BF,
                    is_array: true,
                    entry_len: 8,
                    capacity: 4,
                    default_count: 0,
                    defaults: vec![],
                },
            ],
            addr_width: AddrWidth::U16,
            magic_addr: 0x00FC,
            magic: vec![0xA5, 0x5A, 0xFE, 0x00],
        }
    }

    fn fresh_store() -> SectionStore<MemBackend> {
        let mut store = SectionStore::new(MemBackend::new(0x100), small_map()).unwrap();
        store.init().unwrap();
        store
    }

    #[test]
    fn init_defaults_on_missing_magic() {
        let mut store = fresh_store();
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let n = store.read_current_entry(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn default_then_read_returns_default_blob_bit_exact() {
        let mut store = fresh_store();
        store.default_section(0).unwrap();
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let n = store.read_current_entry(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], store.map().sections[0].defaults.as_slice());
    }

    #[test]
    fn second_init_preserves_data() {
        let mut store = fresh_store();
        store.write_current(0, &[9, 9, 9, 9, 9, 9, 9]).unwrap();

        store.init().unwrap();
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let n = store.read_current_entry(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[9; 7]);
    }

    #[test]
    fn corrupt_entry_detected_and_defaulted_on_init() {
        let mut store = fresh_store();
        store.write_current(0, &[9, 9, 9, 9, 9, 9, 9]).unwrap();
        // Flip a payload byte directly under the checksum.
        store.backend.corrupt(0x0008);

        let mut buf = [0u8; MAX_ENTRY_LEN];
        assert_eq!(store.read_current_entry(0, &mut buf), Err(NvmError::CorruptEntry));

        store.init().unwrap();
        let n = store.read_current_entry(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn append_advances_head_and_flags_full() {
        let mut store = fresh_store();
        let mut full = false;
        for i in 0..4u8 {
            full = store.append(1, &[i; 7], full).unwrap();
        }
        assert!(full, "4th append of a 4-slot ring must report full");
        let hdr = store.read_header(1).unwrap();
        assert_eq!(hdr.head, hdr.tail);
    }

    #[test]
    fn append_when_full_overwrites_oldest() {
        let mut store = fresh_store();
        let mut full = false;
        for i in 0..5u8 {
            full = store.append(1, &[i; 7], full).unwrap();
        }
        assert!(full);
        let hdr = store.read_header(1).unwrap();
        // Oldest slot was reused; tail moved with head.
        assert_eq!(hdr.tail, hdr.head);
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let newest = (u16::from(hdr.head) + 4 - 1) % 4;
        store.read_entry(1, newest, &mut buf).unwrap();
        assert_eq!(buf[0], 4);
    }

    #[test]
    fn transient_backend_failures_are_retried() {
        let mut store = fresh_store();
        store.backend.fail_next_writes(2);
        store.write_current(0, &[5, 5, 5, 5, 5, 5, 5]).unwrap();

        store.backend.fail_next_reads(2);
        let mut buf = [0u8; MAX_ENTRY_LEN];
        assert!(store.read_current_entry(0, &mut buf).is_ok());
    }

    #[test]
    fn persistent_backend_failure_escalates() {
        let mut store = fresh_store();
        store.backend.fail_next_writes(10);
        assert!(matches!(
            store.write_current(0, &[0; 7]),
            Err(NvmError::Backend(_))
        ));
    }
}
