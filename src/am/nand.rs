//! Block-structured NAND simulation.
//!
//! NAND pages cannot be rewritten in place; the handler stages the
//! enclosing erase block in RAM, merges the new bytes, erases, and
//! writes the whole block back. The simulation preserves that shape so
//! wear behavior (erase counts) is observable in tests.

use crate::nvm::{BackendError, NvmBackend};

/// Erase-block size of the target part.
pub const NAND_BLOCK_SIZE: usize = 132 * 1024;

pub struct NandBackend {
    mem: Vec<u8>,
    block_size: usize,
    pub erase_count: u32,
}

impl NandBackend {
    pub fn new(size: usize) -> Self {
        Self::with_block_size(size, NAND_BLOCK_SIZE)
    }

    /// Smaller blocks keep unit tests fast while exercising the same
    /// read-modify-erase-write path.
    pub fn with_block_size(size: usize, block_size: usize) -> Self {
        assert!(size % block_size == 0, "size must be whole blocks");
        Self {
            mem: vec![0xFF; size],
            block_size,
            erase_count: 0,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.mem
    }
}

impl NvmBackend for NandBackend {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        let addr = addr as usize;
        if addr + buf.len() > self.mem.len() {
            return Err(BackendError::Read);
        }
        buf.copy_from_slice(&self.mem[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), BackendError> {
        let addr = addr as usize;
        if addr + bytes.len() > self.mem.len() {
            return Err(BackendError::Write);
        }

        let first_block = addr / self.block_size;
        let last_block = (addr + bytes.len() - 1) / self.block_size;
        let mut staged = vec![0u8; self.block_size];

        for block in first_block..=last_block {
            let base = block * self.block_size;
            // Stage, merge, erase, write back.
            staged.copy_from_slice(&self.mem[base..base + self.block_size]);

            let from = addr.max(base);
            let to = (addr + bytes.len()).min(base + self.block_size);
            staged[from - base..to - base].copy_from_slice(&bytes[from - addr..to - addr]);

            self.mem[base..base + self.block_size].fill(0xFF);
            self.erase_count += 1;
            self.mem[base..base + self.block_size].copy_from_slice(&staged);
        }
        Ok(())
    }
}
