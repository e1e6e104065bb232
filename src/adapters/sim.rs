//! Host simulation of the whole board.
//!
//! Every port is backed by plain fields the caller pokes; the frame
//! sink records transmitted bytes so tests can decode and assert on
//! the SSM's responses.

use crate::algo::NUM_PADS;
use crate::app::ports::{
    Battery, Clock, EnvSample, EnvSensor, FrameLink, PadSampler, Rtc, StrokeSample, StrokeStats,
    SysControl, WakeLine,
};
use crate::asp::{decode_buffer, Direction, Message};

pub struct SimPlatform {
    now_ms: u64,
    pub rtc_valid: bool,
    pub rtc_epoch: u32,
    /// Next `set_epoch` calls fail (RTC part rejecting the write).
    pub rtc_write_fails: bool,
    /// RTC tracks the runtime clock as it advances.
    pub rtc_tracks_runtime: bool,
    sub_second_ms: u64,

    pub voltage_mv: u16,
    pub percent: u8,
    pub measurements_taken: u32,

    pub env: EnvSample,
    pub pads: [u16; NUM_PADS],

    pub stroke: StrokeSample,
    pub stroke_enabled: bool,
    pub magnet: bool,

    pub line_asserted: bool,
    pub sent: Vec<Vec<u8>>,

    pub power_cycles: u32,
    pub sw_resets: u32,
    pub boot_pin: bool,
    pub bootloader_entered: bool,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            rtc_valid: true,
            rtc_epoch: 1_700_000_000,
            rtc_write_fails: false,
            rtc_tracks_runtime: true,
            sub_second_ms: 0,
            voltage_mv: 3600,
            percent: 100,
            measurements_taken: 0,
            env: EnvSample {
                temp_c: 25,
                humidity_pct: 50,
            },
            pads: [800; NUM_PADS],
            stroke: StrokeSample::default(),
            stroke_enabled: false,
            magnet: false,
            line_asserted: false,
            sent: Vec::new(),
            power_cycles: 0,
            sw_resets: 0,
            boot_pin: false,
            bootloader_entered: false,
        }
    }

    /// Advance the runtime clock; the RTC follows unless decoupled.
    pub fn advance_ms(&mut self, ms: u64) {
        self.now_ms += ms;
        if self.rtc_tracks_runtime {
            self.sub_second_ms += ms;
            self.rtc_epoch += (self.sub_second_ms / 1000) as u32;
            self.sub_second_ms %= 1000;
        }
    }

    pub fn advance_secs(&mut self, secs: u32) {
        self.advance_ms(u64::from(secs) * 1000);
    }

    /// Skew the RTC relative to the runtime clock (drift injection).
    pub fn skew_rtc(&mut self, secs: i32) {
        self.rtc_epoch = self.rtc_epoch.wrapping_add_signed(secs);
    }

    /// Decode everything transmitted so far, oldest first.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .iter()
            .filter_map(|frame| decode_buffer(frame, Direction::ToAm).ok())
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl Clock for SimPlatform {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

impl Rtc for SimPlatform {
    fn valid(&self) -> bool {
        self.rtc_valid
    }

    fn epoch(&self) -> u32 {
        if self.rtc_valid {
            self.rtc_epoch
        } else {
            0
        }
    }

    fn set_epoch(&mut self, epoch: u32) -> bool {
        if self.rtc_write_fails {
            return false;
        }
        self.rtc_epoch = epoch;
        self.rtc_valid = true;
        true
    }

    fn hour(&self) -> u8 {
        ((self.rtc_epoch % 86_400) / 3_600) as u8
    }

    fn secs_to_next_hour(&self) -> u16 {
        (3_600 - self.rtc_epoch % 3_600) as u16
    }

    fn secs_since_midnight(&self) -> u32 {
        self.rtc_epoch % 86_400
    }
}

impl Battery for SimPlatform {
    fn take_measurement(&mut self) {
        self.measurements_taken += 1;
    }

    fn voltage_mv(&self) -> u16 {
        self.voltage_mv
    }

    fn percent_remaining(&self) -> u8 {
        self.percent
    }
}

impl EnvSensor for SimPlatform {
    fn trigger_sample(&mut self) {}

    fn latest(&mut self) -> EnvSample {
        self.env
    }
}

impl PadSampler for SimPlatform {
    fn read_pads(&mut self) -> [u16; NUM_PADS] {
        self.pads
    }
}

impl StrokeStats for SimPlatform {
    fn take_hourly(&mut self) -> StrokeSample {
        core::mem::take(&mut self.stroke)
    }

    fn set_enabled(&mut self, on: bool) {
        self.stroke_enabled = on;
    }

    fn magnet_present(&self) -> bool {
        self.magnet
    }
}

impl WakeLine for SimPlatform {
    fn assert_line(&mut self) {
        self.line_asserted = true;
    }

    fn deassert_line(&mut self) {
        self.line_asserted = false;
    }
}

impl SysControl for SimPlatform {
    fn power_cycle(&mut self) {
        self.power_cycles += 1;
    }

    fn sw_reset(&mut self) {
        self.sw_resets += 1;
    }

    fn boot_pin_asserted(&mut self) -> bool {
        self.boot_pin
    }

    fn enter_bootloader(&mut self) {
        self.bootloader_entered = true;
    }
}

impl FrameLink for SimPlatform {
    fn send(&mut self, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
    }
}
