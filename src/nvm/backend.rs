//! Backing-store abstraction for the section store.

use core::fmt;

/// Raw storage failure, surfaced after the store's retry policy is
/// exhausted. The control loop maps these to the EEPROM error bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    Read,
    Write,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read failed"),
            Self::Write => write!(f, "write failed"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Byte-addressable backing store.
///
/// Implementations own the bus discipline: the EEPROM driver polls
/// write-completion by dummy selective read with a 2-second deadline,
/// and the NAND driver turns writes into a read-modify-erase-write of
/// the enclosing block. The store retries each failed operation up to
/// two times before giving up.
pub trait NvmBackend {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BackendError>;
    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), BackendError>;
}

/// In-memory backing store for the host build and the test suites.
/// Fault injection knobs mimic a flaky bus: the next N operations of a
/// kind fail before the store's retry logic sees a success.
pub struct MemBackend {
    mem: Vec<u8>,
    fail_reads: u32,
    fail_writes: u32,
    pub write_ops: u32,
}

impl MemBackend {
    pub fn new(size: usize) -> Self {
        // Fresh EEPROM/NAND reads as erased (0xFF), never as zeroes.
        Self {
            mem: vec![0xFF; size],
            fail_reads: 0,
            fail_writes: 0,
            write_ops: 0,
        }
    }

    pub fn fail_next_reads(&mut self, n: u32) {
        self.fail_reads = n;
    }

    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_writes = n;
    }

    /// Direct view for tests that assert on raw layout.
    pub fn raw(&self) -> &[u8] {
        &self.mem
    }

    pub fn corrupt(&mut self, addr: u32) {
        let addr = addr as usize;
        self.mem[addr] ^= 0xFF;
    }
}

impl NvmBackend for MemBackend {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(BackendError::Read);
        }
        let addr = addr as usize;
        if addr + buf.len() > self.mem.len() {
            return Err(BackendError::Read);
        }
        buf.copy_from_slice(&self.mem[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), BackendError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(BackendError::Write);
        }
        let addr = addr as usize;
        if addr + bytes.len() > self.mem.len() {
            return Err(BackendError::Write);
        }
        self.write_ops += 1;
        self.mem[addr..addr + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
