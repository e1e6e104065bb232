//! Host harness for the AM application.
//!
//! Wires the AM memory map and ASP client against a loopback SSM
//! running in the same process: wake handshake, record fetch, flash
//! persistence, image-registry bookkeeping.

use anyhow::{anyhow, Result};
use log::info;

use pumpsense::adapters::SimPlatform;
use pumpsense::am::{AmLink, AmMemoryMap, NandBackend, SpiTransport};
use pumpsense::app::AppService;
use pumpsense::asp::{AttnList, Command};
use pumpsense::nvm::{ssm_map, MemBackend, SectionStore, SSM_EEPROM_SIZE};
use pumpsense::registry::{OpState, Slot};
use pumpsense::telemetry::CloudRecord;
use pumpsense::FW_VERSION;

/// Loopback transport: every AM frame is fed byte-wise into an
/// in-process SSM, and whatever the SSM transmits comes back.
struct LoopbackSsm {
    app: AppService<MemBackend>,
    platform: SimPlatform,
}

impl LoopbackSsm {
    fn new() -> Result<Self> {
        let mut platform = SimPlatform::new();
        let store = SectionStore::new(MemBackend::new(SSM_EEPROM_SIZE), ssm_map())?;
        let app = AppService::init(store, &mut platform);
        Ok(Self { app, platform })
    }
}

impl SpiTransport for LoopbackSsm {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> usize {
        self.platform.clear_sent();
        for &byte in tx {
            self.app.on_rx_byte(byte, &mut self.platform);
        }
        match self.platform.sent.first() {
            Some(frame) => {
                rx[..frame.len()].copy_from_slice(frame);
                frame.len()
            }
            None => 0,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let memmap = AmMemoryMap::init(NandBackend::new(0x0080_0000))
        .map_err(|e| anyhow!("memory map init: {e}"))?;

    // Record which image is running.
    memmap
        .update_registry(|reg| {
            reg.loaded = Slot::A;
            reg.primary = Slot::A;
            reg.slot_a.op_state = OpState::Full;
            reg.slot_a.version = (
                u32::from(FW_VERSION.0),
                u32::from(FW_VERSION.1),
                u32::from(FW_VERSION.2),
            );
        })
        .map_err(|e| anyhow!("registry update: {e}"))?;

    let mut link = AmLink::new(LoopbackSsm::new()?);

    link.send_command(Command::Activate)
        .map_err(|e| anyhow!("activate: {e}"))?;
    let status = link.get_status().map_err(|e| anyhow!("status: {e}"))?;
    info!(
        "ssm status: state {:?}, fw {}.{}.{}, errors {:#x}",
        status.state, status.fw_version.0, status.fw_version.1, status.fw_version.2, status.error_bits
    );

    link.set_time(1_700_000_000).map_err(|e| anyhow!("set time: {e}"))?;

    let entries = link.get_num_entries().map_err(|e| anyhow!("entries: {e}"))?;
    info!("ssm holds {entries} daily records");

    // Fetch-store-acknowledge for every stored record.
    for _ in 0..entries {
        let daily = link.get_sensor_data().map_err(|e| anyhow!("fetch: {e}"))?;
        let mut record = CloudRecord::from_daily(&daily);
        record.msg_number = memmap.next_msg_number().map_err(|e| anyhow!("msg number: {e}"))?;
        memmap.write_record(&record).map_err(|e| anyhow!("store: {e}"))?;
        link.sensor_data_stored().map_err(|e| anyhow!("ack: {e}"))?;
    }

    link.ack_attention(AttnList::empty())
        .map_err(|e| anyhow!("attn ack: {e}"))?;

    info!(
        "flash now holds {} cloud records",
        memmap.stored_records().map_err(|e| anyhow!("count: {e}"))?
    );

    Ok(())
}
