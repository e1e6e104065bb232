//! Section-header and record decoding must be total over arbitrary
//! stored bytes (a corrupt EEPROM must default, never crash).

#![no_main]

use libfuzzer_sys::fuzz_target;
use pumpsense::nvm::{AddrWidth, DeviceInfo, SectionHeader};
use pumpsense::telemetry::DailyRecord;

fuzz_target!(|data: &[u8]| {
    let _ = SectionHeader::decode(AddrWidth::U16, data);
    let _ = SectionHeader::decode(AddrWidth::U32, data);
    let _ = DeviceInfo::decode(data);
    let _ = DailyRecord::decode_checked(data);
});
