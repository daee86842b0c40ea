//! Serial Transportation.
use std::{
    fmt::Display,
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use anyhow::{Error, Result};
use clap::{ValueEnum, builder::PossibleValue};
use serialport::{ClearBuffer, FlowControl, SerialPort};

use super::Transport;

const SERIAL_TIMEOUT_MS: u64 = 1000;
const READ_CHUNK: usize = 4096;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud9600,
    Baud57600,
    #[default]
    Baud115200,
    Baud230400,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud9600 => 9600,
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud230400 => 230400,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud9600,
            Baudrate::Baud57600,
            Baudrate::Baud115200,
            Baudrate::Baud230400,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud9600 => Some(PossibleValue::new("Baud9600").aliases(["9600"])),
            Baudrate::Baud57600 => Some(PossibleValue::new("Baud57600").aliases(["57600"])),
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud230400 => Some(PossibleValue::new("Baud230400").aliases(["230400"])),
        }
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .flow_control(FlowControl::None)
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any(baudrate: Baudrate) -> Result<Self> {
        Self::open_nth(0, baudrate)
    }

    pub fn set_baudrate(&mut self, baudrate: impl Into<u32>) -> Result<()> {
        self.serial_port.set_baud_rate(baudrate.into())?;
        Ok(())
    }

    /// Reads whatever arrives, blocking up to the port timeout.
    /// `None` once the port is gone.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.serial_port.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Some(0)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.serial_port.set_timeout(timeout)?;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = match self.serial_port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_boot(&mut self, asserted: bool) -> Result<()> {
        self.serial_port.write_request_to_send(asserted)?;
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(asserted)?;
        Ok(())
    }
}

impl crate::bootloader::SerialLink for SerialTransport {
    fn rx(&mut self) -> Option<u8> {
        let mut byte = [0u8];
        loop {
            match self.read_some(&mut byte) {
                Ok(Some(1)) => return Some(byte[0]),
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(e) => {
                    log::error!("serial read failed: {}", e);
                    return None;
                }
            }
        }
    }

    fn tx(&mut self, data: &[u8]) {
        if let Err(e) = self.send_raw(data) {
            log::error!("serial write failed: {}", e);
        }
    }
}
