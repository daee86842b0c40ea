//! Abstract link to the target board.
use std::time::Duration;

use anyhow::Result;

pub use self::serial::{Baudrate, SerialTransport};

mod serial;

/// Abstraction of the transport layer.
/// Usually a serial port, but anything carrying bytes will do.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;

    /// Returns what has arrived, waiting up to `timeout` for the first byte.
    /// An empty result means nothing came.
    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Drops anything received but not yet read.
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drives the boot-select line (ISP entry when asserted at reset).
    fn set_boot(&mut self, _asserted: bool) -> Result<()> {
        Ok(())
    }

    /// Drives the reset line.
    fn set_reset(&mut self, _asserted: bool) -> Result<()> {
        Ok(())
    }
}
