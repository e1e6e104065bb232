//! Double-buffered pad sample windows.
//!
//! The sample stream is laid out as alternating overlap (50-sample) and
//! non-overlap (20-sample) blocks:
//!
//! ```text
//!  ... │ OA(50) │ A(20) │ OB(50) │ B(20) │ OA(50) │ A(20) │ ...
//!            └── window A: OA + A + OB = 120 contiguous samples ──┘
//!                          └── window B: OB + B + OA ──┘
//! ```
//!
//! Reading a window exposes 120 contiguous samples: 50 of look-back,
//! the 20-sample current block, and 50 of look-ahead. A window becomes
//! processable when its trailing overlap block completes, so the writer
//! is always filling the opposite window's non-overlap block while the
//! reader works — the two never touch the same 20-sample region.

use super::NUM_PADS;

const NON_OVERLAP_LEN: usize = 20;
const OVERLAP_LEN: usize = 50;
/// A read window spans look-back + current + look-ahead.
pub const WINDOW_SPAN: u16 = 120;

/// Which 120-sample window is exposed to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    A,
    B,
}

/// Block currently receiving new samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteBlock {
    OverlapA,
    NonOverlapA,
    OverlapB,
    NonOverlapB,
}

type Snapshot = [u16; NUM_PADS];

/// The capture buffers. One instance lives for the whole process.
pub struct PadWindows {
    block_a: [Snapshot; NON_OVERLAP_LEN],
    block_b: [Snapshot; NON_OVERLAP_LEN],
    block_oa: [Snapshot; OVERLAP_LEN],
    block_ob: [Snapshot; OVERLAP_LEN],
    write_idx: usize,
    write_block: WriteBlock,
    read_window: Option<Window>,
    /// Suppresses the bogus window-B trigger after the very first
    /// overlap block fills (its neighbors are still empty).
    first_pass: bool,
}

impl Default for PadWindows {
    fn default() -> Self {
        Self::new()
    }
}

impl PadWindows {
    pub fn new() -> Self {
        Self {
            block_a: [[0; NUM_PADS]; NON_OVERLAP_LEN],
            block_b: [[0; NUM_PADS]; NON_OVERLAP_LEN],
            block_oa: [[0; NUM_PADS]; OVERLAP_LEN],
            block_ob: [[0; NUM_PADS]; OVERLAP_LEN],
            write_idx: 0,
            write_block: WriteBlock::OverlapA,
            read_window: None,
            first_pass: true,
        }
    }

    /// Append one snapshot. Returns the window that just became
    /// processable, if any.
    pub fn push(&mut self, sample: Snapshot) -> Option<Window> {
        let (block, len): (&mut [Snapshot], usize) = match self.write_block {
            WriteBlock::OverlapA => (&mut self.block_oa, OVERLAP_LEN),
            WriteBlock::NonOverlapA => (&mut self.block_a, NON_OVERLAP_LEN),
            WriteBlock::OverlapB => (&mut self.block_ob, OVERLAP_LEN),
            WriteBlock::NonOverlapB => (&mut self.block_b, NON_OVERLAP_LEN),
        };
        block[self.write_idx] = sample;
        self.write_idx += 1;
        if self.write_idx < len {
            return None;
        }

        self.write_idx = 0;
        match self.write_block {
            WriteBlock::OverlapA => {
                self.write_block = WriteBlock::NonOverlapA;
                if self.first_pass {
                    self.first_pass = false;
                    None
                } else {
                    // OA is window B's look-ahead; B is now complete.
                    self.read_window = Some(Window::B);
                    Some(Window::B)
                }
            }
            WriteBlock::NonOverlapA => {
                self.write_block = WriteBlock::OverlapB;
                None
            }
            WriteBlock::OverlapB => {
                self.write_block = WriteBlock::NonOverlapB;
                // OB is window A's look-ahead; A is now complete.
                self.read_window = Some(Window::A);
                Some(Window::A)
            }
            WriteBlock::NonOverlapB => {
                self.write_block = WriteBlock::OverlapA;
                None
            }
        }
    }

    /// Read sample `index` (1-based, 1..=120) of the active window.
    ///
    /// Index layout: 1..=50 is the leading overlap block, 51..=70 the
    /// non-overlap block, 71..=120 the trailing overlap block. Fails
    /// when no window is active or the index is out of range.
    pub fn read_sample(&self, index: u16) -> Option<[i16; NUM_PADS]> {
        if index < 1 || index > WINDOW_SPAN {
            return None;
        }
        let window = self.read_window?;
        let snapshot = if index <= OVERLAP_LEN as u16 {
            let i = usize::from(index) - 1;
            match window {
                Window::A => &self.block_oa[i],
                Window::B => &self.block_ob[i],
            }
        } else if index <= (OVERLAP_LEN + NON_OVERLAP_LEN) as u16 {
            let i = usize::from(index) - 1 - OVERLAP_LEN;
            match window {
                Window::A => &self.block_a[i],
                Window::B => &self.block_b[i],
            }
        } else {
            let i = usize::from(index) - 1 - OVERLAP_LEN - NON_OVERLAP_LEN;
            match window {
                Window::A => &self.block_ob[i],
                Window::B => &self.block_oa[i],
            }
        };
        let mut out = [0i16; NUM_PADS];
        for (dst, &src) in out.iter_mut().zip(snapshot.iter()) {
            *dst = src as i16;
        }
        Some(out)
    }
}
