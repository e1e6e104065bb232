//! The top-level SSM control loop.
//!
//! Single-threaded and cooperative: [`AppService::poll`] is called from
//! the main loop at sub-millisecond cadence, interrupt sources only
//! queue bytes and set flags. Timeouts replace cancellation everywhere
//! — every wait in here carries an explicit deadline.

use log::{info, warn};

use crate::algo::{ReasonCode, WaterAlgo};
use crate::asp::{
    AspError, AttnSource, Command, ConfigPayload, DecoderEvent, Direction, FrameDecoder, Message,
    StatusPayload, TxSlot,
};
use crate::config::DEFAULT_WAKE_INTERVAL_DEACTIVATED;
use crate::diagnostics::{AlgoDiagnostics, DiagAction};
use crate::nvm::{
    DeviceInfo, FullFlagChange, NvmBackend, NvmError, RtcTimeStatus, SectionStore, SensorDataRing,
    NVM_VERSION, SSM_SECT_DEVICE_INFO, SSM_SECT_SENSOR_DATA,
};
use crate::rollup::{DailySingletons, HourlyRollup, HourlySample};
use crate::telemetry::{AppState, DailyRecord, ResetState, MAX_SENSOR_DATA_LOGS};
use crate::{ErrorBits, FW_VERSION};

use super::attention::Attention;
use super::ports::Platform;

pub const SEC_PER_MIN: u32 = 60;
pub const SEC_PER_HOUR: u32 = 3600;
pub const SEC_PER_DAY: u32 = 86_400;

/// Deactivated devices check in on this fixed cadence.
const WAKE_RATE_DEACTIVATED_DAYS: u16 = DEFAULT_WAKE_INTERVAL_DEACTIVATED;
/// Request a fresh RTC sync with (at least) this period.
const TIME_SYNC_RATE_DAYS: u32 = 7;
/// Total liters that self-activate a deployed device.
const LITERS_TO_ACTIVATE: u32 = 50;
/// Critical errors persisting this long force the fault path.
const ERROR_RECOVERY_WAIT_SECS: u32 = 20 * SEC_PER_MIN;
/// Grace between the fault status message and the power cycle.
const FAULT_GRACE_SECS: u32 = 5 * SEC_PER_MIN;
/// The AM must acknowledge attention within this window.
const AM_RESPONSE_TIMEOUT_SECS: u32 = 5 * SEC_PER_MIN;
/// Battery sampling delay after waking the AM (modem inrush).
const AM_BATT_MEASURE_DELAY_SECS: u32 = 15;
/// Persistence may wait at most this long for the pump to go quiet.
const PUMP_ACTIVE_TIMEOUT_SECS: u32 = 10 * SEC_PER_MIN;
/// Boot-time settling period before requesting a first time sync.
const BOOT_TIME_SYNC_WAIT_SECS: u32 = 30 * SEC_PER_MIN;
/// Delay between a HwReset command and the actual power cycle, giving
/// the AM time to finish its cloud session.
const HW_RESET_DELAY_SECS: u32 = 10;
/// Water pipeline cadence.
const ALGO_PERIOD_MS: u64 = 50;
/// Hour anchoring skips an hour when the boundary is closer than this.
const HOUR_ANCHOR_GUARD_SECS: u16 = 5 * 60;

/// The SSM application, generic over its EEPROM backend.
pub struct AppService<B: NvmBackend> {
    store: SectionStore<B>,
    ring: SensorDataRing,
    dev_info: DeviceInfo,

    algo: WaterAlgo,
    rollup: HourlyRollup,
    diag: AlgoDiagnostics,

    decoder: FrameDecoder,
    tx: TxSlot,
    attention: Attention,

    state: AppState,
    /// Reset state reported in status frames: the persisted value from
    /// before this boot, reported once, then `Ok`.
    reset_state: ResetState,
    reset_state_reported: bool,

    errors: ErrorBits,
    error_start_secs: u32,
    fault_status_sent_secs: u32,

    transmission_rate_days: u16,
    time_sync_status: RtcTimeStatus,
    valid_timestamp: bool,
    waiting_on_time_sync: bool,
    last_ts_retry_secs: u32,
    last_time_sync_secs: u32,

    /// Runtime-seconds base for the wake cadence; signed because the
    /// daily drift adjustment can step it backwards.
    last_wakeup_secs: i64,
    last_daily_adjust_secs: u32,
    last_rtc_epoch: u32,
    /// Anchor for the hour-elapse measurement: elapsed = runtime − anchor.
    hour_anchor_secs: i64,

    last_algo_run_ms: u64,

    waiting_on_am: bool,
    wait_on_am_start_secs: u32,
    volt_timer_on: bool,
    volt_timer_start_secs: u32,

    pump_timer_started: bool,
    pump_timer_start_secs: u32,
    pump_timer_expired: bool,

    new_red_flag: bool,
    hw_reset_at_secs: Option<u32>,
}

impl<B: NvmBackend> AppService<B> {
    /// Bring up the application: validate NVM, load device info, apply
    /// the persisted state, and start the no-time path if the RTC has
    /// nothing.
    pub fn init<P: Platform>(mut store: SectionStore<B>, p: &mut P) -> Self {
        if let Err(e) = store.init() {
            warn!("app: NVM init failed: {e}");
        }

        let dev_info = Self::load_device_info(&mut store);
        let ring = SensorDataRing::new(
            SSM_SECT_SENSOR_DATA,
            MAX_SENSOR_DATA_LOGS as u16,
            dev_info.sensor_data_buffer_full,
        );

        let state = dev_info.state;
        let transmission_rate_days = if state == AppState::Deactivated {
            WAKE_RATE_DEACTIVATED_DAYS
        } else {
            dev_info.am_wake_rate_days
        };

        let mut rollup = HourlyRollup::new();
        rollup.set_red_flag_thresholds(dev_info.red_flag_on_pct, dev_info.red_flag_off_pct);

        let mut svc = Self {
            store,
            ring,
            dev_info,
            algo: WaterAlgo::new(),
            rollup,
            diag: AlgoDiagnostics::new(),
            decoder: FrameDecoder::new(Direction::ToSsm),
            tx: TxSlot::new(),
            attention: Attention::new(),
            state,
            reset_state: dev_info.reset_state,
            reset_state_reported: false,
            errors: ErrorBits::new(),
            error_start_secs: 0,
            fault_status_sent_secs: 0,
            transmission_rate_days,
            time_sync_status: RtcTimeStatus::FirstTimeSync,
            valid_timestamp: false,
            waiting_on_time_sync: false,
            last_ts_retry_secs: 0,
            last_time_sync_secs: 0,
            last_wakeup_secs: i64::from(p.runtime_secs()),
            last_daily_adjust_secs: p.runtime_secs(),
            last_rtc_epoch: 0,
            hour_anchor_secs: i64::from(p.runtime_secs()),
            last_algo_run_ms: p.now_ms(),
            waiting_on_am: false,
            wait_on_am_start_secs: 0,
            volt_timer_on: false,
            volt_timer_start_secs: 0,
            pump_timer_started: false,
            pump_timer_start_secs: 0,
            pump_timer_expired: false,
            new_red_flag: false,
            hw_reset_at_secs: None,
        };

        info!("app: state {:?}, wake rate {} days", svc.state, svc.transmission_rate_days);

        // Any reboot that does not go through this path again reads
        // back as unexpected.
        svc.dev_info.reset_state = ResetState::Err;
        // A new boot always wants a first time sync.
        svc.dev_info.rtc_time_status = RtcTimeStatus::FirstTimeSync;
        svc.persist_device_info();

        if svc.state == AppState::Activated && svc.dev_info.stroke_detection_on {
            p.set_enabled(true);
        }

        svc.valid_timestamp = p.valid();
        if svc.valid_timestamp {
            svc.last_rtc_epoch = p.epoch();
            svc.anchor_hour_index(p, false);
        } else {
            warn!("app: no valid RTC time at boot");
            svc.indicate_error(ErrorBits::NO_RTC_TIME, p);
            svc.waiting_on_time_sync = true;
        }

        if svc.reset_state == ResetState::Err {
            let stamp = if svc.valid_timestamp { p.epoch() } else { 0 };
            svc.dev_info.unexpected_reset_counter += 1;
            svc.dev_info.time_of_last_unexpected_reset = stamp;
            svc.persist_device_info();
        }

        svc
    }

    fn load_device_info(store: &mut SectionStore<B>) -> DeviceInfo {
        let mut buf = [0u8; crate::nvm::store::MAX_ENTRY_LEN];
        let info = store
            .read_current_entry(SSM_SECT_DEVICE_INFO, &mut buf)
            .ok()
            .and_then(|n| DeviceInfo::decode(&buf[..n]))
            .filter(|info| info.nvm_version == NVM_VERSION);

        match info {
            Some(mut info) => {
                info.sanitize();
                info
            }
            None => {
                warn!("app: device info invalid, defaulting");
                let _ = store.default_section(SSM_SECT_DEVICE_INFO);
                DeviceInfo::default()
            }
        }
    }

    // ── Accessors (status, tests, CLI collaborator) ───────────

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn error_bits(&self) -> ErrorBits {
        self.errors
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.dev_info
    }

    pub fn attention_list(&self) -> crate::asp::AttnList {
        self.attention.list()
    }

    pub fn stored_entries(&mut self) -> u16 {
        self.ring.len(&mut self.store).unwrap_or(0)
    }

    pub fn water_algo(&self) -> &WaterAlgo {
        &self.algo
    }

    /// Tear down, releasing the section store (reboot tests).
    pub fn into_store(self) -> SectionStore<B> {
        self.store
    }

    /// Reset state as reported over ASP: the persisted pre-boot value
    /// once, then `Ok`.
    fn reported_reset_state(&mut self) -> ResetState {
        if self.reset_state_reported {
            ResetState::Ok
        } else {
            self.reset_state_reported = true;
            self.reset_state
        }
    }

    // ── Main loop ─────────────────────────────────────────────

    /// One pass of the cooperative main loop.
    pub fn poll<P: Platform>(&mut self, p: &mut P) {
        let now_ms = p.now_ms();
        let now = p.runtime_secs();

        // Without a valid time, retry the request once per day.
        if !self.valid_timestamp
            && !self.waiting_on_time_sync
            && now.wrapping_sub(self.last_ts_retry_secs) >= SEC_PER_DAY
        {
            self.last_ts_retry_secs = now;
            warn!("app: still without a valid time");
            self.indicate_error(ErrorBits::NO_RTC_TIME, p);
            self.indicate_need_time(p);
        }

        // 30-minute settling period after power-up, then ask for time.
        if !self.valid_timestamp && self.waiting_on_time_sync && now >= BOOT_TIME_SYNC_WAIT_SECS {
            self.waiting_on_time_sync = false;
            self.last_ts_retry_secs = now;
            self.indicate_need_time(p);
        }

        // Deactivated check-in cadence, with a forced time refresh.
        if self.state == AppState::Deactivated
            && i64::from(now) - self.last_wakeup_secs
                >= i64::from(self.transmission_rate_days) * i64::from(SEC_PER_DAY)
        {
            self.last_wakeup_secs = i64::from(now);
            self.set_time_sync_status(RtcTimeStatus::SyncPeriodic);
            self.indicate_check_in(p);
        }

        // The 50 ms algorithm cadence.
        if now_ms.wrapping_sub(self.last_algo_run_ms) >= ALGO_PERIOD_MS {
            self.run_algo_tick(now_ms, p);
        }

        // Hour alignment and daily persistence only make sense with a
        // trustworthy timestamp.
        if self.state == AppState::Activated && self.valid_timestamp {
            self.check_hour_boundary(p);
            self.check_daily_persistence(now, p);
        }

        // AM response deadline.
        if self.waiting_on_am && now.wrapping_sub(self.wait_on_am_start_secs) >= AM_RESPONSE_TIMEOUT_SECS {
            warn!("app: AM did not acknowledge, retrying");
            self.indicate_error(ErrorBits::AM_NOT_RESPONSIVE, p);
            p.deassert_line();
            self.wake_am(p);
        }

        // Deferred battery measurement after AM power-on.
        if self.volt_timer_on && now.wrapping_sub(self.volt_timer_start_secs) >= AM_BATT_MEASURE_DELAY_SECS {
            self.volt_timer_on = false;
            p.take_measurement();
        }

        // Critical-error aggregation: 20 minutes to recover, then the
        // fault path with a single status opportunity.
        if self.errors.critical() != 0 {
            if now.wrapping_sub(self.error_start_secs) >= ERROR_RECOVERY_WAIT_SECS {
                if self.state != AppState::Fault {
                    warn!("app: unrecovered critical errors, entering fault");
                    self.state = AppState::Fault;
                    self.fault_status_sent_secs = now;
                    self.attention.raise(AttnSource::SsmError);
                    self.indicate_check_in(p);
                } else if now.wrapping_sub(self.fault_status_sent_secs) >= FAULT_GRACE_SECS {
                    info!("app: power cycling after fault grace");
                    p.power_cycle();
                }
            }
        }

        // Daily drift compensation against the RTC.
        if self.valid_timestamp && now.wrapping_sub(self.last_daily_adjust_secs) >= SEC_PER_DAY {
            self.last_daily_adjust_secs = now;
            let rtc_now = p.epoch();
            let rtc_delta = i64::from(rtc_now.wrapping_sub(self.last_rtc_epoch));
            self.last_wakeup_secs -= i64::from(SEC_PER_DAY) - rtc_delta;
            self.last_rtc_epoch = rtc_now;

            // Diagnostic flags are per-day.
            let rec = self.rollup.record_mut();
            rec.error_bits &= !(ErrorBits::AVG_SAMPLE_PERIOD_DRIFT | ErrorBits::MISSED_SAMPLE_THRESH);
            self.diag.reset_daily();
        }

        // Pending hardware reset from a HwReset command.
        if let Some(deadline) = self.hw_reset_at_secs {
            if now >= deadline {
                self.hw_reset_at_secs = None;
                p.power_cycle();
            }
        }

        // The AM signals a pending firmware load over the boot pin;
        // entering the bootloader must never interrupt an EEPROM write,
        // which is why it is polled here and nowhere else.
        if p.boot_pin_asserted() {
            info!("app: boot pin high, jumping to bootloader");
            self.dev_info.reset_state = ResetState::Swr;
            self.persist_device_info();
            p.enter_bootloader();
            return;
        }

        // Attention-line invariant: asserted iff sources are pending.
        if self.attention.is_empty() {
            p.deassert_line();
        } else {
            p.assert_line();
        }
    }

    fn run_algo_tick<P: Platform>(&mut self, now_ms: u64, p: &mut P) {
        for action in self.diag.observe(self.last_algo_run_ms, now_ms) {
            match action {
                DiagAction::None => {}
                DiagAction::FlagDaily { bit } => {
                    self.rollup.record_mut().error_bits |= bit;
                }
                DiagAction::ReinitAlgorithm { bit } => {
                    self.rollup.record_mut().error_bits |= bit;
                    warn!("app: re-initializing water algorithm");
                    self.algo.reinit();
                }
                DiagAction::Escalate { bit } => {
                    self.indicate_error(ErrorBits::escalate_algo(bit), p);
                }
            }
        }
        self.last_algo_run_ms = now_ms;

        let sample = p.read_pads();
        if let Some(reasons) = self.algo.tick(sample) {
            let rec = self.rollup.record_mut();
            for reason in reasons {
                rec.error_bits |= match reason {
                    ReasonCode::WaterCalibCalibrated => ErrorBits::WATER_CALIB,
                    ReasonCode::WaterCalibReset => ErrorBits::WATER_CALIB_RESET,
                    ReasonCode::WaterCalibNegDelta => ErrorBits::WATER_CALIB_NEG,
                    ReasonCode::WaterBadSample => ErrorBits::WATER_BAD_SAMPLE,
                    ReasonCode::StandingWater => ErrorBits::WATER_STANDING,
                    ReasonCode::CloggedPump => ErrorBits::WATER_CLOGGED_PUMP,
                    ReasonCode::VolumeCapped => ErrorBits::WATER_VOLUME_CAPPED,
                };
            }
        }

        // A not-yet-activated pump self-activates once enough water has
        // demonstrably been pumped.
        if self.state != AppState::Activated {
            let total = self.dev_info.total_liters.saturating_add(self.algo.pending_liters());
            if total >= LITERS_TO_ACTIVATE {
                self.indicate_activation(p);
            }
        }
    }

    // ── Hour / day bookkeeping ────────────────────────────────

    fn hour_elapsed_secs<P: Platform>(&self, p: &P) -> i64 {
        i64::from(p.runtime_secs()) - self.hour_anchor_secs
    }

    fn set_hour_elapsed<P: Platform>(&mut self, elapsed: i64, p: &P) {
        self.hour_anchor_secs = i64::from(p.runtime_secs()) - elapsed;
    }

    /// Re-anchor the hour index from the RTC. With less than five
    /// minutes to the boundary, skip one hour so the same hour is not
    /// logged twice.
    fn anchor_hour_index<P: Platform>(&mut self, p: &mut P, drop_partial_hour: bool) {
        if !self.valid_timestamp {
            return;
        }

        if self.state == AppState::Activated {
            let to_next = p.secs_to_next_hour();
            let mut hour = p.hour();
            let elapsed = if to_next <= HOUR_ANCHOR_GUARD_SECS {
                hour += 1;
                i64::from(SEC_PER_HOUR) - i64::from(to_next) - i64::from(SEC_PER_HOUR)
            } else {
                i64::from(SEC_PER_HOUR) - i64::from(to_next)
            };
            self.rollup.set_hour_index(hour % 24);
            self.set_hour_elapsed(elapsed, p);

            if drop_partial_hour {
                // Data gathered without a timestamp is unplaceable.
                let _ = self.algo.take_hourly_liters();
                let _ = p.take_hourly();
            }
        }

        self.last_daily_adjust_secs = p.runtime_secs();
        self.last_rtc_epoch = p.epoch();
    }

    fn check_hour_boundary<P: Platform>(&mut self, p: &mut P) {
        if self.hour_elapsed_secs(p) < i64::from(SEC_PER_HOUR) {
            return;
        }

        self.advance_hour(p);

        // Re-align the next boundary to the RTC.
        let hour = self.rollup.hour_index();
        let since_midnight = p.secs_since_midnight();
        let elapsed = if hour == 0 && since_midnight > u32::from(SEC_PER_HOUR) / 2 {
            i64::from(since_midnight) - i64::from(SEC_PER_DAY)
        } else {
            i64::from(since_midnight) - i64::from(hour) * i64::from(SEC_PER_HOUR)
        };
        self.set_hour_elapsed(elapsed, p);
    }

    fn advance_hour<P: Platform>(&mut self, p: &mut P) {
        // Start the next temp/humidity conversion first thing.
        p.trigger_sample();

        let liters = self.algo.take_hourly_liters();
        if liters > 0 {
            self.dev_info.total_liters = self.dev_info.total_liters.saturating_add(liters);
            self.persist_device_info();
        }

        let strokes = p.take_hourly();
        let env = p.latest();
        let sample = HourlySample {
            liters: liters.min(u32::from(u16::MAX)) as u16,
            temp_c: env.temp_c,
            humidity_pct: env.humidity_pct,
            strokes: strokes.strokes,
            stroke_height: strokes.stroke_height,
        };

        {
            let rec = self.rollup.record_mut();
            rec.pump_capacity = strokes.pump_capacity;
            rec.pump_usage = strokes.pump_usage;
            rec.dry_strokes = strokes.dry_strokes;
            rec.dry_stroke_height = strokes.dry_stroke_height;
        }

        let singles = DailySingletons {
            battery_voltage_mv: p.voltage_mv(),
            state: self.state,
            activated_date: self.dev_info.recent_act_date,
            unexpected_resets: self.dev_info.unexpected_reset_counter,
            time_of_last_reset: self.dev_info.time_of_last_unexpected_reset,
            error_bits: self.errors.word(),
            total_liters: self.dev_info.total_liters,
        };

        let outcome = self.rollup.advance_hour(p.epoch(), sample, &singles);
        if outcome.new_red_flag {
            info!("app: new red flag detected");
            self.new_red_flag = true;
        }
    }

    fn check_daily_persistence<P: Platform>(&mut self, now: u32, p: &mut P) {
        if !self.rollup.daily_ready() {
            return;
        }

        // Persist only once the pump is quiet, or after the ten-minute
        // pump-active timeout.
        if self.algo.water_present() && !self.pump_timer_expired {
            if !self.pump_timer_started {
                self.pump_timer_started = true;
                self.pump_timer_start_secs = now;
                info!("app: pump active, delaying daily persistence");
            } else if now.wrapping_sub(self.pump_timer_start_secs) >= PUMP_ACTIVE_TIMEOUT_SECS {
                self.pump_timer_expired = true;
            }
            return;
        }

        let record = self.rollup.take_ready_record();
        self.log_daily_record(&record, p);
        self.pump_timer_expired = false;
        self.pump_timer_started = false;

        // Enough accumulated days (or a fresh red flag) wakes the AM.
        let entries = self.stored_entries();
        if entries >= self.transmission_rate_days || self.new_red_flag {
            if now.wrapping_sub(self.last_time_sync_secs) >= TIME_SYNC_RATE_DAYS * SEC_PER_DAY {
                info!("app: requesting a time sync with this wake");
                self.last_time_sync_secs = now;
                self.set_time_sync_status(RtcTimeStatus::SyncPeriodic);
            }
            self.indicate_check_in(p);
            self.new_red_flag = false;
        }
    }

    fn log_daily_record<P: Platform>(&mut self, record: &DailyRecord, p: &mut P) {
        match self.ring.push(&mut self.store, record) {
            Ok(FullFlagChange::BecameFull) => {
                self.dev_info.sensor_data_buffer_full = true;
                self.persist_device_info();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("app: failed to log daily record: {e}");
                self.indicate_nvm_error(&e, p);
            }
        }
    }

    // ── Attention / wake plumbing ─────────────────────────────

    fn wake_am<P: Platform>(&mut self, p: &mut P) {
        let now = p.runtime_secs();
        self.waiting_on_am = true;
        self.wait_on_am_start_secs = now;
        self.volt_timer_on = true;
        self.volt_timer_start_secs = now;
        p.assert_line();
    }

    fn indicate_activation<P: Platform>(&mut self, p: &mut P) {
        self.attention.raise(AttnSource::Activate);
        self.wake_am(p);
    }

    fn indicate_need_time<P: Platform>(&mut self, p: &mut P) {
        self.attention.raise(AttnSource::RequestTime);
        if self.errors.contains(ErrorBits::NO_RTC_TIME) {
            // Completely without time: piggyback a deactivated-style
            // check-in so at least a status header reaches the cloud.
            self.attention.raise(AttnSource::CheckInDeactivated);
            self.wake_am(p);
        }
    }

    fn indicate_check_in<P: Platform>(&mut self, p: &mut P) {
        if self.state == AppState::Activated {
            self.attention.raise(AttnSource::CheckInActivated);
        } else {
            self.attention.raise(AttnSource::CheckInDeactivated);
        }
        if self.time_sync_status != RtcTimeStatus::Updated {
            self.indicate_need_time(p);
        }
        self.wake_am(p);
    }

    // ── Error word ────────────────────────────────────────────

    /// Set an error bit; the first critical bit arms the 20-minute
    /// recovery timer.
    pub fn indicate_error<P: Platform>(&mut self, bit: u32, p: &mut P) {
        if bit & !ErrorBits::NON_CRITICAL_MASK != 0 && self.errors.critical() == 0 {
            self.error_start_secs = p.runtime_secs();
        }
        self.errors.set(bit);
    }

    pub fn indicate_error_resolved(&mut self, bit: u32) {
        self.errors.clear(bit);
    }

    fn indicate_nvm_error<P: Platform>(&mut self, e: &NvmError, p: &mut P) {
        match e {
            NvmError::Backend(crate::nvm::BackendError::Read) => {
                self.indicate_error(ErrorBits::EEPROM_READ_ERROR, p);
            }
            NvmError::Backend(crate::nvm::BackendError::Write) => {
                self.indicate_error(ErrorBits::EEPROM_WRITE_ERROR, p);
            }
            _ => {}
        }
    }

    // ── Device-info persistence ───────────────────────────────

    fn persist_device_info(&mut self) {
        let mut buf = [0u8; DeviceInfo::ENCODED_LEN];
        let n = self.dev_info.encode(&mut buf);
        if let Err(e) = self.store.write_current(SSM_SECT_DEVICE_INFO, &buf[..n]) {
            warn!("app: device-info write failed: {e}");
            self.errors.set(ErrorBits::EEPROM_WRITE_ERROR);
        }
    }

    fn set_time_sync_status(&mut self, status: RtcTimeStatus) {
        self.time_sync_status = status;
        self.dev_info.rtc_time_status = status;
        self.persist_device_info();
    }

    // ── ASP receive path ──────────────────────────────────────

    /// Feed one byte from the SPI receive queue.
    pub fn on_rx_byte<P: Platform>(&mut self, byte: u8, p: &mut P) {
        match self.decoder.feed(byte) {
            Some(DecoderEvent::Frame(msg)) => self.dispatch(msg, p),
            Some(DecoderEvent::Invalid(e)) => self.handle_erroneous(e, p),
            None => {}
        }
    }

    fn handle_erroneous<P: Platform>(&mut self, e: AspError, p: &mut P) {
        warn!("app: invalid SPI message: {e}");
        self.transmit(&Message::Nack, p);
    }

    fn transmit<P: Platform>(&mut self, msg: &Message, p: &mut P) {
        let bytes = self.tx.encode(msg);
        p.send(bytes);
    }

    fn transmit_ack<P: Platform>(&mut self, id: u8, p: &mut P) {
        self.transmit(&Message::Ack(id), p);
    }

    fn dispatch<P: Platform>(&mut self, msg: Message, p: &mut P) {
        match msg {
            Message::Command(cmd) => self.handle_command(cmd, p),
            Message::SetRtc(epoch) => self.handle_set_rtc(epoch, p),
            Message::Config(cfg) => self.handle_config(cfg, p),
            Message::GetSensorData(_) => self.handle_get_sensor_data(p),
            Message::AttnAck(list) => {
                self.transmit_ack(crate::asp::MsgId::AttnAck as u8, p);
                self.handle_attn_ack(list, p);
            }
            // The direction table keeps SSM-bound traffic to the five
            // IDs above; anything else is unreachable here.
            _ => self.handle_erroneous(AspError::InvalidMsgId, p),
        }
    }

    fn handle_command<P: Platform>(&mut self, cmd: Command, p: &mut P) {
        match cmd {
            Command::GetStatus => {
                let status = self.build_status(p);
                self.transmit(&Message::Status(status), p);
            }
            Command::SwReset => {
                self.transmit_ack(cmd as u8, p);
                p.sw_reset();
            }
            Command::GetEntriesInLog => {
                let n = self.stored_entries();
                self.transmit(&Message::NumDataEntries(n), p);
            }
            Command::GetAttnSrc => {
                let list = self.attention.list();
                self.transmit(&Message::AttnSrc(list), p);
            }
            Command::Activate => {
                self.transmit_ack(cmd as u8, p);
                self.handle_activate(p);
            }
            Command::Deactivate => {
                self.transmit_ack(cmd as u8, p);
                self.handle_deactivate(p);
            }
            Command::IncrementSensorDataTail => {
                self.transmit_ack(cmd as u8, p);
                self.handle_increment_tail(p);
            }
            Command::HwReset => {
                self.transmit_ack(cmd as u8, p);
                info!("app: hardware reset in {HW_RESET_DELAY_SECS}s");
                self.hw_reset_at_secs = Some(p.runtime_secs() + HW_RESET_DELAY_SECS);
            }
            Command::ResetAlarms => {
                self.transmit_ack(cmd as u8, p);
                info!("app: resetting alarm data");
                self.rollup.reset_red_flag_data();
                self.new_red_flag = false;
            }
            Command::ResetNvmSensorData => {
                self.transmit_ack(cmd as u8, p);
                if self.store.default_section(SSM_SECT_SENSOR_DATA).is_ok() {
                    self.ring.reset();
                    self.dev_info.sensor_data_buffer_full = false;
                    self.persist_device_info();
                }
            }
            Command::PrepFwUpdate => {
                // Flush anything volatile; the actual bootloader entry
                // rides on the boot pin, not this command.
                self.transmit_ack(cmd as u8, p);
                self.persist_device_info();
            }
        }
    }

    fn handle_set_rtc<P: Platform>(&mut self, epoch: u32, p: &mut P) {
        self.transmit_ack(crate::asp::MsgId::SetRtc as u8, p);
        if p.set_epoch(epoch) {
            self.set_time_updated(p);
        } else {
            self.set_time_failed(p);
        }
    }

    fn handle_config<P: Platform>(&mut self, cfg: ConfigPayload, p: &mut P) {
        let runtime = cfg.to_config();
        if !runtime.validate() {
            // No field is applied from a config that fails validation.
            self.handle_erroneous(AspError::Erroneous, p);
            return;
        }
        self.transmit_ack(crate::asp::MsgId::Config as u8, p);

        info!(
            "app: config: wake {} days, stroke {}, red flag {}/{} %",
            runtime.wake_interval_days, runtime.stroke_alg_on, runtime.red_flag_on_pct, runtime.red_flag_off_pct
        );

        self.dev_info.apply_config(&runtime);
        self.persist_device_info();
        self.transmission_rate_days = runtime.wake_interval_days;

        if runtime.stroke_alg_on {
            if self.state == AppState::Activated {
                p.set_enabled(true);
            }
        } else {
            p.set_enabled(false);
        }

        self.rollup.set_red_flag_thresholds(runtime.red_flag_on_pct, runtime.red_flag_off_pct);
    }

    fn handle_get_sensor_data<P: Platform>(&mut self, p: &mut P) {
        match self.ring.read_latest::<_, DailyRecord>(&mut self.store) {
            Ok(record) => self.transmit(&Message::SensorData(Box::new(record)), p),
            Err(e) => {
                self.indicate_nvm_error(&e, p);
                self.handle_erroneous(AspError::Erroneous, p);
            }
        }
    }

    fn handle_attn_ack<P: Platform>(&mut self, acked: crate::asp::AttnList, p: &mut P) {
        if self.attention.acknowledge(acked) {
            info!("app: attention acknowledged");
            p.deassert_line();
            self.waiting_on_am = false;
            if self.errors.contains(ErrorBits::AM_NOT_RESPONSIVE) {
                self.indicate_error_resolved(ErrorBits::AM_NOT_RESPONSIVE);
            }
        }
    }

    fn handle_increment_tail<P: Platform>(&mut self, p: &mut P) {
        match self.ring.increment_tail(&mut self.store) {
            Ok(FullFlagChange::Cleared) => {
                self.dev_info.sensor_data_buffer_full = false;
                self.persist_device_info();
            }
            Ok(_) => {}
            Err(e) => self.indicate_nvm_error(&e, p),
        }
    }

    fn handle_activate<P: Platform>(&mut self, p: &mut P) {
        info!("app: activate command");
        if self.state == AppState::Activated {
            return;
        }

        self.state = AppState::Activated;
        self.dev_info.state = AppState::Activated;
        let stamp = p.epoch();
        self.dev_info.recent_act_date = stamp;
        if self.dev_info.first_act_date == 0 {
            self.dev_info.first_act_date = stamp;
        }
        self.dev_info.num_act = self.dev_info.num_act.saturating_add(1);
        self.persist_device_info();

        if self.valid_timestamp {
            self.anchor_hour_index(p, false);
        }

        self.transmission_rate_days = self.dev_info.am_wake_rate_days;
        self.last_wakeup_secs = i64::from(p.runtime_secs());

        if self.dev_info.stroke_detection_on {
            p.set_enabled(true);
        }
    }

    fn handle_deactivate<P: Platform>(&mut self, p: &mut P) {
        info!("app: deactivate command");
        if self.state == AppState::Deactivated {
            return;
        }

        self.state = AppState::Deactivated;
        self.dev_info.state = AppState::Deactivated;
        self.dev_info.recent_deact_date = p.epoch();
        self.dev_info.recent_act_date = 0;
        self.dev_info.num_deact = self.dev_info.num_deact.saturating_add(1);
        self.dev_info.sensor_data_buffer_full = false;
        self.persist_device_info();

        let _ = self.store.default_section(SSM_SECT_SENSOR_DATA);
        self.ring.reset();

        self.transmission_rate_days = WAKE_RATE_DEACTIVATED_DAYS;
        p.set_enabled(false);

        self.rollup = HourlyRollup::new();
        self.rollup
            .set_red_flag_thresholds(self.dev_info.red_flag_on_pct, self.dev_info.red_flag_off_pct);
        self.algo.reinit();
    }

    fn set_time_updated<P: Platform>(&mut self, p: &mut P) {
        self.set_time_sync_status(RtcTimeStatus::Updated);
        self.valid_timestamp = true;
        self.anchor_hour_index(p, true);
        if self.errors.contains(ErrorBits::NO_RTC_TIME) {
            self.indicate_error_resolved(ErrorBits::NO_RTC_TIME);
        }
    }

    fn set_time_failed<P: Platform>(&mut self, p: &mut P) {
        warn!("app: AM time sync failed");
        if self.errors.contains(ErrorBits::NO_RTC_TIME) {
            self.valid_timestamp = false;
            // Try again in 24 hours.
            self.last_ts_retry_secs = p.runtime_secs();
        }
    }

    fn build_status<P: Platform>(&mut self, p: &mut P) -> StatusPayload {
        StatusPayload {
            reset_state: self.reported_reset_state(),
            state: self.state,
            fw_version: FW_VERSION,
            error_bits: self.errors.word(),
            timestamp: p.epoch(),
            voltage_mv: u32::from(p.voltage_mv()),
            power_remaining_pct: u32::from(p.percent_remaining()),
            magnet_detected: p.magnet_present(),
            breakdown: self.rollup.record().breakdown,
            activated_date: self.dev_info.recent_act_date,
            unexpected_reset_count: self.dev_info.unexpected_reset_counter,
            time_last_reset: self.dev_info.time_of_last_unexpected_reset,
        }
    }
}
