//! Host harness for the SSM application.
//!
//! Runs the control loop against the simulated board: a day of idle
//! sampling, one synthetic pumping session, and an hour rollover, then
//! prints where the state machine ended up. The real target wraps the
//! same `AppService` in board glue out of tree.

use anyhow::Result;
use heapless::spsc::Queue;
use log::info;

use pumpsense::adapters::SimPlatform;
use pumpsense::app::AppService;
use pumpsense::asp::{encode_frame, Command, Message, MAX_FRAME};
use pumpsense::nvm::{ssm_map, MemBackend, SectionStore, SSM_EEPROM_SIZE};

/// SPI receive queue between the (simulated) ISR half and the main
/// loop. On target, the SPI interrupt is the producer.
const RX_QUEUE_DEPTH: usize = 2 * MAX_FRAME;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut platform = SimPlatform::new();
    let store = SectionStore::new(MemBackend::new(SSM_EEPROM_SIZE), ssm_map())?;
    let mut app = AppService::init(store, &mut platform);

    // Activate over the wire, the way the AM would: the "ISR" enqueues
    // the frame bytes, the main loop drains them.
    let mut rx_queue: Queue<u8, RX_QUEUE_DEPTH> = Queue::new();
    let (mut rx_producer, mut rx_consumer) = rx_queue.split();

    let mut frame = [0u8; MAX_FRAME];
    let n = encode_frame(&Message::Command(Command::Activate), &mut frame);
    for &byte in &frame[..n] {
        rx_producer.enqueue(byte).expect("rx queue sized for whole frames");
    }
    while let Some(byte) = rx_consumer.dequeue() {
        app.on_rx_byte(byte, &mut platform);
    }
    info!("state after activate: {:?}", app.state());

    // A quiet hour at 50 ms cadence.
    for _ in 0..(3600 * 1000 / 50) {
        platform.advance_ms(50);
        app.poll(&mut platform);
    }

    // A pumping session: the bottom three pads drop hard, hold, then
    // recover.
    let mut wet = platform.pads;
    for pad in 5..8 {
        wet[pad] = 760;
    }
    platform.pads = wet;
    for _ in 0..600 {
        platform.advance_ms(50);
        app.poll(&mut platform);
    }
    platform.pads = [800; 8];
    for _ in 0..2000 {
        platform.advance_ms(50);
        app.poll(&mut platform);
    }

    info!(
        "session done: water present = {}, pending liters = {}",
        app.water_algo().water_present(),
        app.water_algo().pending_liters()
    );
    info!(
        "stored daily records: {}, attention = {:?}",
        app.stored_entries(),
        app.attention_list()
    );
    info!("frames transmitted to the AM: {}", platform.sent.len());

    Ok(())
}
