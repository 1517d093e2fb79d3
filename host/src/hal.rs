//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     gpio output for the per-node indicator leds. abstracts away the
//!     difference between running on a real Raspberry Pi (using `rppal`) and a
//!     development machine (mock that only logs).
//!
//! relationships:
//!     - used by: indicator.rs
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

pub trait HardwareProvider: Send + Sync {
    /// configure `pin` as a push-pull output, driven low
    fn set_output(&self, pin: u8) -> Result<()>;
    fn write_gpio(&self, pin: u8, level: bool) -> Result<()>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Hal {}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new() -> Result<Self> {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Ok(Self {})
    }
}

#[cfg(not(feature = "hardware"))]
impl HardwareProvider for Hal {
    fn set_output(&self, pin: u8) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} set to output", pin);
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} write {}", pin, level);
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Hal {
    gpio: rppal::gpio::Gpio,
}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new() -> Result<Self> {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        Ok(Self { gpio: rppal::gpio::Gpio::new()? })
    }

    fn output(&self, pin: u8) -> Result<rppal::gpio::OutputPin> {
        let mut p = self.gpio.get(pin)?.into_output();
        // keep the level after the handle is dropped
        p.set_reset_on_drop(false);
        Ok(p)
    }
}

#[cfg(feature = "hardware")]
impl HardwareProvider for Hal {
    fn set_output(&self, pin: u8) -> Result<()> {
        self.output(pin)?.set_low();
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        let mut p = self.output(pin)?;
        if level { p.set_high(); } else { p.set_low(); }
        Ok(())
    }
}
