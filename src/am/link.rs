//! AM side of the ASP link: build requests, classify responses.
//!
//! The AM is the SPI master; each exchange is one transmitted frame
//! followed by one received buffer. A NACK is a protocol-level retry
//! signal for the caller's policy — nothing retries automatically at
//! this layer.

use log::warn;

use crate::asp::{
    decode_buffer, AspError, AttnList, Command, ConfigPayload, Direction, Message, MsgId,
    StatusPayload, TxSlot, MAX_FRAME,
};
use crate::telemetry::DailyRecord;

/// One request/response SPI transaction. Implementations own chip
/// select and inter-byte timing; a return of 0 means the SSM produced
/// nothing before the transaction deadline.
pub trait SpiTransport {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> usize;
}

/// Typed request client over a transport.
pub struct AmLink<T: SpiTransport> {
    transport: T,
    tx: TxSlot,
}

impl<T: SpiTransport> AmLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            tx: TxSlot::new(),
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send `msg` and decode whatever comes back.
    fn exchange(&mut self, msg: &Message) -> Result<Message, AspError> {
        let frame = self.tx.encode(msg);
        let mut rx = [0u8; MAX_FRAME];
        let n = self.transport.transfer(frame, &mut rx);
        if n == 0 {
            return Err(AspError::Timeout);
        }
        match decode_buffer(&rx[..n], Direction::ToAm) {
            Ok(Message::Nack) => Err(AspError::Nacked),
            Ok(msg) => Ok(msg),
            Err(e) => {
                warn!("am link: bad response: {e}");
                Err(e)
            }
        }
    }

    /// Send a command and require an Ack echoing it.
    pub fn send_command(&mut self, cmd: Command) -> Result<(), AspError> {
        match self.exchange(&Message::Command(cmd))? {
            Message::Ack(id) if id == cmd as u8 => Ok(()),
            _ => Err(AspError::Erroneous),
        }
    }

    pub fn get_status(&mut self) -> Result<StatusPayload, AspError> {
        match self.exchange(&Message::Command(Command::GetStatus))? {
            Message::Status(status) => Ok(status),
            _ => Err(AspError::Erroneous),
        }
    }

    pub fn get_attn_sources(&mut self) -> Result<AttnList, AspError> {
        match self.exchange(&Message::Command(Command::GetAttnSrc))? {
            Message::AttnSrc(list) => Ok(list),
            _ => Err(AspError::Erroneous),
        }
    }

    pub fn get_num_entries(&mut self) -> Result<u16, AspError> {
        match self.exchange(&Message::Command(Command::GetEntriesInLog))? {
            Message::NumDataEntries(n) => Ok(n),
            _ => Err(AspError::Erroneous),
        }
    }

    pub fn get_sensor_data(&mut self) -> Result<DailyRecord, AspError> {
        match self.exchange(&Message::GetSensorData(1))? {
            Message::SensorData(record) => Ok(*record),
            _ => Err(AspError::Erroneous),
        }
    }

    /// Confirm the fetched record reached flash; the SSM pops it.
    pub fn sensor_data_stored(&mut self) -> Result<(), AspError> {
        self.send_command(Command::IncrementSensorDataTail)
    }

    pub fn set_time(&mut self, epoch: u32) -> Result<(), AspError> {
        match self.exchange(&Message::SetRtc(epoch))? {
            Message::Ack(id) if id == MsgId::SetRtc as u8 => Ok(()),
            _ => Err(AspError::Erroneous),
        }
    }

    pub fn send_config(&mut self, cfg: ConfigPayload) -> Result<(), AspError> {
        match self.exchange(&Message::Config(cfg))? {
            Message::Ack(id) if id == MsgId::Config as u8 => Ok(()),
            _ => Err(AspError::Erroneous),
        }
    }

    /// Acknowledge serviced attention sources by echoing the
    /// still-pending set.
    pub fn ack_attention(&mut self, still_pending: AttnList) -> Result<(), AspError> {
        match self.exchange(&Message::AttnAck(still_pending))? {
            Message::Ack(id) if id == MsgId::AttnAck as u8 => Ok(()),
            _ => Err(AspError::Erroneous),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport with a scripted response queue.
    struct ScriptedTransport {
        responses: Vec<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                responses: Vec::new(),
                sent: Vec::new(),
            }
        }

        fn queue(&mut self, msg: &Message) {
            let mut slot = TxSlot::new();
            self.responses.push(slot.encode(msg).to_vec());
        }
    }

    impl SpiTransport for ScriptedTransport {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> usize {
            self.sent.push(tx.to_vec());
            match self.responses.first() {
                Some(resp) => {
                    let n = resp.len();
                    rx[..n].copy_from_slice(resp);
                    self.responses.remove(0);
                    n
                }
                None => 0,
            }
        }
    }

    #[test]
    fn command_ack_round_trip() {
        let mut transport = ScriptedTransport::new();
        transport.queue(&Message::Ack(Command::Activate as u8));
        let mut link = AmLink::new(transport);
        assert!(link.send_command(Command::Activate).is_ok());
    }

    #[test]
    fn nack_surfaces_as_nacked() {
        let mut transport = ScriptedTransport::new();
        transport.queue(&Message::Nack);
        let mut link = AmLink::new(transport);
        assert_eq!(link.send_command(Command::Activate), Err(AspError::Nacked));
    }

    #[test]
    fn silence_surfaces_as_timeout() {
        let mut link = AmLink::new(ScriptedTransport::new());
        assert_eq!(link.get_status().err(), Some(AspError::Timeout));
    }

    #[test]
    fn mismatched_ack_id_is_erroneous() {
        let mut transport = ScriptedTransport::new();
        transport.queue(&Message::Ack(Command::Deactivate as u8));
        let mut link = AmLink::new(transport);
        assert_eq!(link.send_command(Command::Activate), Err(AspError::Erroneous));
    }

    #[test]
    fn num_entries_round_trip() {
        let mut transport = ScriptedTransport::new();
        transport.queue(&Message::NumDataEntries(17));
        let mut link = AmLink::new(transport);
        assert_eq!(link.get_num_entries(), Ok(17));
    }
}
