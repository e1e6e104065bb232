//! Activated-path integration: hour-aligned rollup, daily persistence,
//! wake-the-AM policy, and the pump-active persistence gate.

use pumpsense::adapters::SimPlatform;
use pumpsense::app::ports::StrokeSample;
use pumpsense::app::service::{SEC_PER_HOUR, SEC_PER_MIN};
use pumpsense::app::AppService;
use pumpsense::asp::{encode_frame, AttnSource, Command, Message, MAX_FRAME};
use pumpsense::nvm::{ssm_map, MemBackend, SectionStore, SSM_EEPROM_SIZE};
use pumpsense::telemetry::AppState;

/// Midnight-aligned epoch keeps the hour bookkeeping transparent.
const MIDNIGHT: u32 = 1_699_920_000;

fn activated_fixture() -> (AppService<MemBackend>, SimPlatform) {
    let mut platform = SimPlatform::new();
    platform.rtc_epoch = MIDNIGHT;
    let store = SectionStore::new(MemBackend::new(SSM_EEPROM_SIZE), ssm_map()).unwrap();
    let mut app = AppService::init(store, &mut platform);

    let mut frame = [0u8; MAX_FRAME];
    let n = encode_frame(&Message::Command(Command::Activate), &mut frame);
    for &byte in &frame[..n] {
        app.on_rx_byte(byte, &mut platform);
    }
    assert_eq!(app.state(), AppState::Activated);
    platform.clear_sent();
    (app, platform)
}

fn advance_hours(app: &mut AppService<MemBackend>, platform: &mut SimPlatform, hours: u32) {
    for _ in 0..hours {
        platform.advance_secs(SEC_PER_HOUR);
        app.poll(platform);
    }
}

#[test]
fn a_full_day_persists_one_record() {
    let (mut app, mut platform) = activated_fixture();
    platform.env.temp_c = 31;
    platform.env.humidity_pct = 44;

    advance_hours(&mut app, &mut platform, 23);
    assert_eq!(app.stored_entries(), 0, "day still in progress");

    advance_hours(&mut app, &mut platform, 1);
    assert_eq!(app.stored_entries(), 1, "midnight closes the day");
    assert!(!platform.line_asserted, "one day is below the wake interval");
}

#[test]
fn environment_and_stroke_data_plumb_into_the_hour_slots() {
    let (mut app, mut platform) = activated_fixture();
    platform.env.temp_c = 28;
    platform.env.humidity_pct = 61;
    platform.stroke = StrokeSample {
        strokes: 120,
        stroke_height: 9,
        ..StrokeSample::default()
    };

    // The first advance closes hour slot 0 with this hour's inputs;
    // the remaining hours run with idle stroke counters.
    advance_hours(&mut app, &mut platform, 1);
    platform.stroke = StrokeSample::default();
    advance_hours(&mut app, &mut platform, 23);
    assert_eq!(app.stored_entries(), 1);

    platform.clear_sent();
    let mut frame = [0u8; MAX_FRAME];
    let n = encode_frame(&Message::GetSensorData(1), &mut frame);
    for &byte in &frame[..n] {
        app.on_rx_byte(byte, &mut platform);
    }
    let sent = platform.sent_messages();
    let Message::SensorData(record) = &sent[0] else {
        panic!("expected a sensor-data frame, got {sent:?}");
    };
    assert_eq!(record.temp_per_hour[0], 28);
    assert_eq!(record.humidity_per_hour[0], 61);
    assert_eq!(record.strokes_per_hour[0], 120);
    assert_eq!(record.stroke_height_per_hour[0], 9);
    assert_eq!(record.state, AppState::Activated);
    assert_eq!(record.battery_voltage_mv, 3600);
}

#[test]
fn accumulated_days_wake_the_am_with_a_time_sync() {
    let (mut app, mut platform) = activated_fixture();

    // Default wake interval is 7 days of records.
    advance_hours(&mut app, &mut platform, 6 * 24);
    assert_eq!(app.stored_entries(), 6);
    assert!(!platform.line_asserted);

    advance_hours(&mut app, &mut platform, 24);
    assert_eq!(app.stored_entries(), 7);
    assert!(platform.line_asserted, "seven stored days wake the AM");
    assert!(app.attention_list().contains(AttnSource::CheckInActivated));
    // Seven days since boot also means a time-sync request rides along.
    assert!(app.attention_list().contains(AttnSource::RequestTime));
}

#[test]
fn pump_activity_defers_persistence_up_to_ten_minutes() {
    let (mut app, mut platform) = activated_fixture();

    advance_hours(&mut app, &mut platform, 23);

    // Start a pumping session shortly before midnight: drop the bottom
    // pads and tick the algorithm into Measuring.
    for pad in 5..8 {
        platform.pads[pad] = 760;
    }
    for _ in 0..200 {
        platform.advance_ms(50);
        app.poll(&mut platform);
    }
    assert!(app.water_algo().water_present(), "session in progress");

    // Midnight arrives while water is present: the record stays
    // buffered.
    platform.advance_secs(SEC_PER_HOUR);
    app.poll(&mut platform);
    assert_eq!(app.stored_entries(), 0, "persistence deferred while pumping");

    // Ten minutes later the pump-active timeout forces the write.
    for _ in 0..10 {
        platform.advance_secs(SEC_PER_MIN);
        app.poll(&mut platform);
    }
    app.poll(&mut platform);
    assert_eq!(app.stored_entries(), 1);
}
