use std::collections::HashMap;

use thiserror::Error;

#[cfg(feature = "gpio")]
pub mod gpio;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("GPIO controller unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open GPIO pin {pin}: {reason}")]
    Open { pin: u8, reason: String },
}

/// One physical relay output. Implementations own the underlying device
/// handle; dropping the object releases the line.
pub trait RelayPin: Send {
    fn set(&mut self, on: bool);
}

/// Opens relay outputs by pin number.
pub trait RelayBackend: Send {
    fn open(&self, pin: u8) -> Result<Box<dyn RelayPin>, RelayError>;
}

/// Fallback backend for hosts without GPIO hardware. Commands are logged
/// and otherwise discarded.
pub struct NullBackend;

impl RelayBackend for NullBackend {
    fn open(&self, pin: u8) -> Result<Box<dyn RelayPin>, RelayError> {
        Ok(Box::new(NullPin { pin }))
    }
}

struct NullPin {
    pin: u8,
}

impl RelayPin for NullPin {
    fn set(&mut self, on: bool) {
        tracing::debug!(pin = self.pin, on, "Relay command (no GPIO backend)");
    }
}

/// Opens the GPIO backend when compiled in, the logging fallback
/// otherwise.
#[cfg(feature = "gpio")]
pub fn default_backend(active_low: bool) -> Result<Box<dyn RelayBackend>, RelayError> {
    Ok(Box::new(gpio::GpioBackend::new(active_low)?))
}

#[cfg(not(feature = "gpio"))]
pub fn default_backend(_active_low: bool) -> Result<Box<dyn RelayBackend>, RelayError> {
    tracing::warn!("Built without GPIO support, relay commands are logged only");
    Ok(Box::new(NullBackend))
}

/* == Relay bank == */

enum Slot {
    Ready { device: Box<dyn RelayPin>, on: bool },
    Failed,
}

/// Tracks every live relay handle. A pin whose initialization failed stays
/// in the bank as a logged no-op, so one bad output cannot take down the
/// automation loop.
pub struct RelayBank {
    backend: Box<dyn RelayBackend>,
    slots: HashMap<u8, Slot>,
}

impl RelayBank {
    pub fn new(backend: Box<dyn RelayBackend>) -> Self {
        RelayBank {
            backend,
            slots: HashMap::new(),
        }
    }

    /// Opens the relay for `pin` in the OFF position. Calling this on an
    /// already-initialized pin is a no-op.
    pub fn initialize(&mut self, pin: u8) {
        if self.slots.contains_key(&pin) {
            return;
        }

        let slot = match self.backend.open(pin) {
            Ok(mut device) => {
                device.set(false);
                tracing::info!(pin, "Fan relay initialized");
                Slot::Ready { device, on: false }
            }
            Err(error) => {
                tracing::error!(pin, %error, "Failed to initialize fan relay");
                Slot::Failed
            }
        };

        self.slots.insert(pin, slot);
    }

    pub fn turn_on(&mut self, pin: u8) {
        self.set(pin, true);
    }

    pub fn turn_off(&mut self, pin: u8) {
        self.set(pin, false);
    }

    pub fn is_on(&self, pin: u8) -> bool {
        matches!(self.slots.get(&pin), Some(Slot::Ready { on: true, .. }))
    }

    /// Forces the relay OFF and drops its handle, returning the line to the
    /// host. Safe to call on unknown pins.
    pub fn release(&mut self, pin: u8) {
        if let Some(Slot::Ready { mut device, .. }) = self.slots.remove(&pin) {
            device.set(false);
            tracing::info!(pin, "Fan relay released");
        }
    }

    /// Drives every tracked pin OFF and releases all handles. Invoked at
    /// process exit.
    pub fn shutdown_all(&mut self) {
        for (pin, slot) in &mut self.slots {
            if let Slot::Ready { device, on } = slot {
                device.set(false);
                *on = false;
                tracing::info!(pin, "Fan relay shut down");
            }
        }

        self.slots.clear();
    }

    fn set(&mut self, pin: u8, on: bool) {
        self.initialize(pin);

        match self.slots.get_mut(&pin) {
            Some(Slot::Ready { device, on: state }) => {
                device.set(on);
                *state = on;
                tracing::debug!(pin, on, "Fan relay driven");
            }
            Some(Slot::Failed) => {
                tracing::warn!(pin, on, "Fan relay unavailable, ignoring command");
            }
            None => {}
        }
    }
}

/* == Test support == */
