/// Positive acknowledgement from the bootloader.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement, followed by an error code byte.
pub const NAK: u8 = 0x15;

/// Sent by the bootloader once it serves commands.
pub const READY_BANNER: &str = "LPCBlaster ready.\r\n";

/// Size of the AHB RAM window used as the staging buffer.
pub const STAGING_CAPACITY: usize = 32 * 1024;

/// Maximum number of sectors in a table and in one partial erase request.
pub const MAX_SECTORS: usize = 30;

/// Flash programming granularity.
pub const FLASH_PAGE_SIZE: u32 = 256;
pub const MAX_PROGRAM_CHUNK: u32 = 4096;
pub const WORK_ALIGNMENT: u16 = 4;

pub const SECTOR_ERASE_TIMEOUT: u32 = 12000;

pub mod opcodes {
    pub const LOAD: u8 = b'L';
    pub const ZERO: u8 = b'Z';
    pub const READBACK: u8 = b'R';
    pub const ERASE_SECTORS: u8 = b'E';
    pub const ERASE_FULL: u8 = b'F';
    pub const ERASE_AND_PROGRAM: u8 = b'W';
    pub const RESET: u8 = b'K';
    pub const EXIT_TO_LOADER: u8 = b'X';
}

/// NXP ISP line protocol.
pub mod isp {
    pub const AUTOBAUD: &[u8] = b"?";
    pub const SYNCHRONIZED: &[u8] = b"Synchronized\r\n";
    pub const SYNCHRONIZED_OK: &[u8] = b"Synchronized\rOK\r\n";
    pub const ECHO_OFF: &[u8] = b"A 0\r\n";
    pub const ECHO_OFF_OK: &[u8] = b"A 0\r0\r\n";

    pub const BLOCK_OK: &[u8] = b"OK\r\n";
    pub const BLOCK_RESEND: &[u8] = b"RESEND\r\n";

    pub const UNLOCK_CODE: u32 = 23130;

    /// Raw bytes carried by one encoded line.
    pub const LINE_BYTES: usize = 45;
    /// Encoded lines between two checksum lines.
    pub const LINES_PER_BATCH: usize = 20;
}

/// Sub-codes sent after a NAK to tell apart the checks sharing one error code.
pub mod detail {
    // OutOfRange
    pub const WORK_RANGE: u8 = 1;
    pub const FLASH_OVERFLOW: u8 = 2;
    pub const FLASH_UNMAPPED: u8 = 3;
    pub const CHUNK_UNMAPPED: u8 = 4;
    pub const TOO_MANY_SECTORS: u8 = 1;
    pub const UNKNOWN_SECTOR: u8 = 2;

    // NotAligned
    pub const FLASH_OFFSET_ALIGN: u8 = 1;
    pub const WORK_OFFSET_ALIGN: u8 = 2;
    pub const LENGTH_ALIGN: u8 = 3;

    // FlashOperationFailure
    pub const PREPARE: u8 = 1;
    pub const ERASE: u8 = 2;
    pub const CHUNK_PREPARE: u8 = 3;
    pub const CHUNK_COPY: u8 = 5;
}
