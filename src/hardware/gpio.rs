use rppal::gpio::{Gpio, OutputPin};

use super::{RelayBackend, RelayError, RelayPin};

/// Raspberry Pi backend. Most fan relay boards trigger on a low output
/// level, hence the `active_low` switch.
pub struct GpioBackend {
    gpio: Gpio,
    active_low: bool,
}

impl GpioBackend {
    pub fn new(active_low: bool) -> Result<Self, RelayError> {
        let gpio = Gpio::new().map_err(|error| RelayError::Unavailable(error.to_string()))?;

        Ok(GpioBackend { gpio, active_low })
    }
}

impl RelayBackend for GpioBackend {
    fn open(&self, pin: u8) -> Result<Box<dyn RelayPin>, RelayError> {
        let map_err = |error: rppal::gpio::Error| RelayError::Open {
            pin,
            reason: error.to_string(),
        };

        let line = self.gpio.get(pin).map_err(map_err)?;

        // Start in the de-energized position
        let output = match self.active_low {
            true => line.into_output_high(),
            false => line.into_output_low(),
        };

        Ok(Box::new(GpioRelay {
            output,
            active_low: self.active_low,
        }))
    }
}

struct GpioRelay {
    output: OutputPin,
    active_low: bool,
}

impl RelayPin for GpioRelay {
    fn set(&mut self, on: bool) {
        match on == self.active_low {
            true => self.output.set_low(),
            false => self.output.set_high(),
        }
    }
}
