//! LPCBlaster: a serial bootloader for LPC17xx MCUs, and the host side that
//! installs it through the NXP ISP and drives it.

pub mod blaster;
pub mod bootloader;
pub mod chip;
pub mod codec;
pub mod command;
pub mod constants;
pub mod flashing;
pub mod format;
pub mod isp;
pub mod protocol;
pub mod sector;
pub mod session;
pub mod transport;

pub use self::bootloader::{Bootloader, BootloaderConfig};
pub use self::chip::{Chip, ChipDB};
pub use self::flashing::Blaster;
pub use self::protocol::{Completion, DeviceError, ErrorCode, Opcode, Request};
pub use self::session::{Chain, Event, Session};
pub use self::transport::Transport;
