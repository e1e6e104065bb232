//! Attention-line adapter over an embedded-hal output pin.

use embedded_hal::digital::OutputPin;

use crate::app::ports::WakeLine;

/// Drives the SSM→AM wake GPIO. Pin errors are swallowed: there is no
/// recovery for a broken GPIO beyond the watchdog.
pub struct GpioWakeLine<P: OutputPin> {
    pin: P,
}

impl<P: OutputPin> GpioWakeLine<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: OutputPin> WakeLine for GpioWakeLine<P> {
    fn assert_line(&mut self) {
        let _ = self.pin.set_high();
    }

    fn deassert_line(&mut self) {
        let _ = self.pin.set_low();
    }
}
