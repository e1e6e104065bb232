//! Typed ASP payloads and their byte codecs.

use enumset::{EnumSet, EnumSetType};

use super::{AspError, Direction, MAX_PAYLOAD};
use crate::config::RuntimeConfig;
use crate::telemetry::{AppState, DailyRecord, ResetState};
use crate::wire::{Reader, Writer};

// ───────────────────────────────────────────────────────────────
// Message IDs
// ───────────────────────────────────────────────────────────────

/// Frame identifiers, one per message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgId {
    Config = 0x10,
    Command = 0x11,
    SetRtc = 0x12,
    GetSensorData = 0x13,
    Status = 0x20,
    SensorData = 0x21,
    AttnSrc = 0x23,
    NumDataEntries = 0x24,
    AttnAck = 0x25,
    Ack = 0x91,
    Nack = 0x92,
}

impl MsgId {
    /// Map a raw ID byte, honoring the per-direction allow table.
    pub fn from_u8(raw: u8, dir: Direction) -> Option<Self> {
        let id = match raw {
            0x10 => Self::Config,
            0x11 => Self::Command,
            0x12 => Self::SetRtc,
            0x13 => Self::GetSensorData,
            0x20 => Self::Status,
            0x21 => Self::SensorData,
            0x23 => Self::AttnSrc,
            0x24 => Self::NumDataEntries,
            0x25 => Self::AttnAck,
            0x91 => Self::Ack,
            0x92 => Self::Nack,
            _ => return None,
        };
        if dir == Direction::ToSsm && !id.allowed_to_ssm() {
            return None;
        }
        Some(id)
    }

    /// IDs the SSM accepts from the AM.
    fn allowed_to_ssm(self) -> bool {
        matches!(
            self,
            Self::Config | Self::Command | Self::SetRtc | Self::GetSensorData | Self::AttnAck
        )
    }
}

// ───────────────────────────────────────────────────────────────
// Commands (payload of MsgId::Command)
// ───────────────────────────────────────────────────────────────

/// One-byte commands carried by `Command` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    HwReset = 0,
    SwReset = 1,
    GetStatus = 2,
    GetAttnSrc = 3,
    GetEntriesInLog = 4,
    PrepFwUpdate = 5,
    Deactivate = 6,
    Activate = 7,
    ResetNvmSensorData = 8,
    IncrementSensorDataTail = 9,
    ResetAlarms = 10,
}

impl Command {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::HwReset,
            1 => Self::SwReset,
            2 => Self::GetStatus,
            3 => Self::GetAttnSrc,
            4 => Self::GetEntriesInLog,
            5 => Self::PrepFwUpdate,
            6 => Self::Deactivate,
            7 => Self::Activate,
            8 => Self::ResetNvmSensorData,
            9 => Self::IncrementSensorDataTail,
            10 => Self::ResetAlarms,
            _ => return None,
        })
    }
}

// ───────────────────────────────────────────────────────────────
// Attention sources
// ───────────────────────────────────────────────────────────────

/// Reasons the SSM raises the attention line. The set's `u8` repr is
/// the wire byte of `AttnSrc`/`AttnAck` payloads.
#[derive(Debug, EnumSetType)]
pub enum AttnSource {
    Activate = 0,
    RequestTime = 1,
    CheckInActivated = 2,
    CheckInDeactivated = 3,
    SsmError = 4,
}

pub type AttnList = EnumSet<AttnSource>;

/// Rebuild an attention list from its wire byte, dropping undefined
/// bits.
pub fn attn_list_from_u8(raw: u8) -> AttnList {
    AttnList::from_u8_truncated(raw)
}

// ───────────────────────────────────────────────────────────────
// Config payload
// ───────────────────────────────────────────────────────────────

/// Configuration pushed by the AM. Two reserved slots pad the layout
/// for future parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigPayload {
    pub wake_interval_days: u16,
    pub stroke_alg_on: bool,
    pub red_flag_on_pct: u16,
    pub red_flag_off_pct: u16,
    pub reserved_4: u16,
    pub reserved_5: u16,
}

impl ConfigPayload {
    pub const LEN: usize = 11;

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            wake_interval_days: cfg.wake_interval_days,
            stroke_alg_on: cfg.stroke_alg_on,
            red_flag_on_pct: cfg.red_flag_on_pct,
            red_flag_off_pct: cfg.red_flag_off_pct,
            reserved_4: 0,
            reserved_5: 0,
        }
    }

    pub fn to_config(self) -> RuntimeConfig {
        RuntimeConfig {
            wake_interval_days: self.wake_interval_days,
            stroke_alg_on: self.stroke_alg_on,
            red_flag_on_pct: self.red_flag_on_pct,
            red_flag_off_pct: self.red_flag_off_pct,
        }
    }

    fn encode(&self, w: &mut Writer<'_>) {
        w.put_u16(self.wake_interval_days);
        w.put_bool(self.stroke_alg_on);
        w.put_u16(self.red_flag_on_pct);
        w.put_u16(self.red_flag_off_pct);
        w.put_u16(self.reserved_4);
        w.put_u16(self.reserved_5);
    }

    fn decode(r: &mut Reader<'_>) -> Self {
        Self {
            wake_interval_days: r.take_u16(),
            stroke_alg_on: r.take_bool(),
            red_flag_on_pct: r.take_u16(),
            red_flag_off_pct: r.take_u16(),
            reserved_4: r.take_u16(),
            reserved_5: r.take_u16(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Status payload
// ───────────────────────────────────────────────────────────────

/// SSM status snapshot, sent in response to `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub reset_state: ResetState,
    pub state: AppState,
    pub fw_version: (u8, u8, u8),
    pub error_bits: u32,
    pub timestamp: u32,
    pub voltage_mv: u32,
    pub power_remaining_pct: u32,
    pub magnet_detected: bool,
    pub breakdown: bool,
    pub activated_date: u32,
    pub unexpected_reset_count: u32,
    pub time_last_reset: u32,
}

impl StatusPayload {
    pub const LEN: usize = 35;

    fn encode(&self, w: &mut Writer<'_>) {
        w.put_u8(self.reset_state as u8);
        w.put_u8(self.state as u8);
        w.put_u8(self.fw_version.0);
        w.put_u8(self.fw_version.1);
        w.put_u8(self.fw_version.2);
        w.put_u32(self.error_bits);
        w.put_u32(self.timestamp);
        w.put_u32(self.voltage_mv);
        w.put_u32(self.power_remaining_pct);
        w.put_bool(self.magnet_detected);
        w.put_bool(self.breakdown);
        w.put_u32(self.activated_date);
        w.put_u32(self.unexpected_reset_count);
        w.put_u32(self.time_last_reset);
    }

    fn decode(r: &mut Reader<'_>) -> Self {
        Self {
            reset_state: ResetState::from_u8(r.take_u8()),
            state: AppState::from_u8(r.take_u8()),
            fw_version: (r.take_u8(), r.take_u8(), r.take_u8()),
            error_bits: r.take_u32(),
            timestamp: r.take_u32(),
            voltage_mv: r.take_u32(),
            power_remaining_pct: r.take_u32(),
            magnet_detected: r.take_bool(),
            breakdown: r.take_bool(),
            activated_date: r.take_u32(),
            unexpected_reset_count: r.take_u32(),
            time_last_reset: r.take_u32(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Message
// ───────────────────────────────────────────────────────────────

/// A fully-typed ASP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Config(ConfigPayload),
    Command(Command),
    SetRtc(u32),
    /// Request the next sensor-data entry; the field counts entries.
    GetSensorData(u16),
    Status(StatusPayload),
    SensorData(Box<DailyRecord>),
    AttnSrc(AttnList),
    NumDataEntries(u16),
    AttnAck(AttnList),
    Ack(u8),
    Nack,
}

impl Message {
    pub fn id(&self) -> MsgId {
        match self {
            Self::Config(_) => MsgId::Config,
            Self::Command(_) => MsgId::Command,
            Self::SetRtc(_) => MsgId::SetRtc,
            Self::GetSensorData(_) => MsgId::GetSensorData,
            Self::Status(_) => MsgId::Status,
            Self::SensorData(_) => MsgId::SensorData,
            Self::AttnSrc(_) => MsgId::AttnSrc,
            Self::NumDataEntries(_) => MsgId::NumDataEntries,
            Self::AttnAck(_) => MsgId::AttnAck,
            Self::Ack(_) => MsgId::Ack,
            Self::Nack => MsgId::Nack,
        }
    }

    /// Declared payload length for this message.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Config(_) => ConfigPayload::LEN,
            Self::Command(_) | Self::Ack(_) => 1,
            Self::SetRtc(_) => 4,
            Self::GetSensorData(_) | Self::NumDataEntries(_) => 2,
            Self::Status(_) => StatusPayload::LEN,
            Self::SensorData(_) => DailyRecord::ENTRY_LEN,
            Self::AttnSrc(_) | Self::AttnAck(_) => 1,
            Self::Nack => 0,
        }
    }

    /// Serialize just the payload into `buf`; returns bytes written.
    pub fn encode_payload(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::Config(cfg) => {
                let mut w = Writer::new(buf);
                cfg.encode(&mut w);
                w.pos()
            }
            Self::Command(cmd) => {
                buf[0] = *cmd as u8;
                1
            }
            Self::SetRtc(epoch) => {
                let mut w = Writer::new(buf);
                w.put_u32(*epoch);
                w.pos()
            }
            Self::GetSensorData(n) | Self::NumDataEntries(n) => {
                let mut w = Writer::new(buf);
                w.put_u16(*n);
                w.pos()
            }
            Self::Status(status) => {
                let mut w = Writer::new(buf);
                status.encode(&mut w);
                w.pos()
            }
            Self::SensorData(rec) => rec.encode_with_checksum(buf),
            Self::AttnSrc(list) | Self::AttnAck(list) => {
                buf[0] = list.as_u8_truncated();
                1
            }
            Self::Ack(id) => {
                buf[0] = *id;
                1
            }
            Self::Nack => 0,
        }
    }

    /// Rebuild a typed message from an ID and raw payload bytes,
    /// enforcing the per-ID payload length.
    pub fn decode(id: MsgId, payload: &[u8]) -> Result<Self, AspError> {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let expect = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(AspError::Erroneous)
            }
        };
        match id {
            MsgId::Config => {
                expect(ConfigPayload::LEN)?;
                Ok(Self::Config(ConfigPayload::decode(&mut Reader::new(payload))))
            }
            MsgId::Command => {
                expect(1)?;
                Command::from_u8(payload[0])
                    .map(Self::Command)
                    .ok_or(AspError::Erroneous)
            }
            MsgId::SetRtc => {
                expect(4)?;
                Ok(Self::SetRtc(Reader::new(payload).take_u32()))
            }
            MsgId::GetSensorData => {
                expect(2)?;
                Ok(Self::GetSensorData(Reader::new(payload).take_u16()))
            }
            MsgId::Status => {
                expect(StatusPayload::LEN)?;
                Ok(Self::Status(StatusPayload::decode(&mut Reader::new(payload))))
            }
            MsgId::SensorData => {
                expect(DailyRecord::ENTRY_LEN)?;
                DailyRecord::decode_checked(payload)
                    .map(|rec| Self::SensorData(Box::new(rec)))
                    .ok_or(AspError::InvalidChecksum)
            }
            MsgId::AttnSrc => {
                expect(1)?;
                Ok(Self::AttnSrc(attn_list_from_u8(payload[0])))
            }
            MsgId::NumDataEntries => {
                expect(2)?;
                Ok(Self::NumDataEntries(Reader::new(payload).take_u16()))
            }
            MsgId::AttnAck => {
                expect(1)?;
                Ok(Self::AttnAck(attn_list_from_u8(payload[0])))
            }
            MsgId::Ack => {
                expect(1)?;
                Ok(Self::Ack(payload[0]))
            }
            MsgId::Nack => {
                expect(0)?;
                Ok(Self::Nack)
            }
        }
    }
}
