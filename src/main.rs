use std::{fs, path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};

use lpcblaster::bootloader::{Halt, SimulatedTarget};
use lpcblaster::transport::{Baudrate, SerialTransport};
use lpcblaster::{Blaster, Bootloader, BootloaderConfig, ChipDB, Transport, codec, format};

#[derive(Parser)]
#[command(
    name = "LPCBlaster CLI",
    version,
    about = "Installs the LPCBlaster bootloader through the NXP ISP and drives it"
)]
struct Cli {
    /// Serial port, the first one found if omitted
    #[arg(long, short, global = true)]
    port: Option<String>,

    #[arg(long, short, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    #[arg(long, short, global = true, default_value = "LPC1768")]
    chip: String,

    /// Seconds to wait for an answer from the device
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

    /// Leave the RTS/DTR lines alone instead of resetting into ISP
    #[arg(long, global = true)]
    no_reset: bool,

    /// Turn debugging information on
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// List known chips
    Chips,
    /// Run the ISP handshake only
    Sync,
    /// Read memory through the ISP
    IspRead {
        #[arg(value_parser = parse_int::parse::<u32>)]
        offset: u32,
        #[arg(value_parser = parse_int::parse::<u32>)]
        length: u32,
    },
    /// Write a file to RAM through the ISP
    IspWrite {
        #[arg(value_parser = parse_int::parse::<u32>)]
        offset: u32,
        path: PathBuf,
    },
    /// Start the bootloader from ISP RAM and wait until it is ready
    Bootstrap {
        /// Bootloader image (ELF, Intel HEX or raw binary at the chip's load address)
        path: PathBuf,
    },
    /// Copy a file into the staging buffer
    Load {
        #[arg(value_parser = parse_int::parse::<u16>)]
        offset: u16,
        path: PathBuf,
    },
    /// Clear part of the staging buffer
    Zero {
        #[arg(value_parser = parse_int::parse::<u16>)]
        offset: u16,
        #[arg(value_parser = parse_int::parse::<u16>)]
        length: u16,
    },
    /// Read any memory range through the bootloader
    Readback {
        #[arg(value_parser = parse_int::parse::<u32>)]
        offset: u32,
        #[arg(value_parser = parse_int::parse::<u32>)]
        length: u32,
        /// Write to a file instead of dumping
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Erase flash sectors by index
    Erase {
        #[arg(required = true, value_parser = parse_int::parse::<u8>)]
        sectors: Vec<u8>,
    },
    /// Erase the whole flash
    EraseFull,
    /// Erase and program flash from the staging buffer
    Program {
        #[arg(value_parser = parse_int::parse::<u32>)]
        flash_offset: u32,
        #[arg(value_parser = parse_int::parse::<u16>)]
        work_offset: u16,
        #[arg(value_parser = parse_int::parse::<u16>)]
        length: u16,
    },
    /// Program a firmware image into flash and verify it
    Flash {
        path: PathBuf,
        /// Bootstrap this bootloader first instead of attaching to a running one
        #[arg(long)]
        bootloader: Option<PathBuf>,
        /// Reset into the new firmware afterwards
        #[arg(long)]
        reset: bool,
    },
    /// Reset the target through the bootloader
    Reset,
    /// Leave the bootloader for the ROM ISP
    ExitIsp,
    /// Print a file as ISP block lines
    Encode { path: PathBuf },
    /// Serve the bootloader protocol on the port against a simulated flash
    Emulate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match &cli.command {
        Commands::Ports => {
            for port in SerialTransport::scan_ports()? {
                println!("{}", port);
            }
            return Ok(());
        }
        Commands::Chips => {
            let db = ChipDB::load()?;
            for name in db.chip_names() {
                println!("{}", name);
            }
            return Ok(());
        }
        Commands::Encode { path } => {
            let data = fs::read(path)?;
            for line in codec::encode(&data)? {
                println!("{}", String::from_utf8_lossy(&line));
            }
            return Ok(());
        }
        Commands::Emulate => return emulate(&cli),
        _ => (),
    }

    let chip = ChipDB::find_chip(&cli.chip)?;
    let mut blaster = Blaster::open_serial(
        cli.port.as_deref(),
        cli.baudrate,
        chip,
        Duration::from_secs(cli.timeout),
    )?;
    blaster.dump_info();

    match cli.command {
        Commands::Sync => connect(&mut blaster, cli.no_reset)?,
        Commands::IspRead { offset, length } => {
            connect(&mut blaster, cli.no_reset)?;
            let data = blaster.isp_read(offset, length)?;
            dump_hex(offset, &data);
        }
        Commands::IspWrite { offset, path } => {
            connect(&mut blaster, cli.no_reset)?;
            let data = fs::read(path)?;
            blaster.isp_write(offset, &data)?;
            log::info!("Wrote {} bytes at {:#010x}", data.len(), offset);
        }
        Commands::Bootstrap { path } => {
            let image = format::read_firmware_from_file(path, blaster.chip().load_address)?;
            connect(&mut blaster, cli.no_reset)?;
            blaster.bootstrap(&image)?;
        }
        Commands::Load { offset, path } => {
            let data = fs::read(path)?;
            blaster.attach();
            for (i, block) in data.chunks(1024).enumerate() {
                let at = u16::try_from(offset as usize + i * 1024)?;
                blaster.load(at, block)?;
            }
            log::info!("Loaded {} bytes at staging offset {:#06x}", data.len(), offset);
        }
        Commands::Zero { offset, length } => {
            blaster.attach();
            blaster.zero(offset, length)?;
        }
        Commands::Readback {
            offset,
            length,
            out,
        } => {
            blaster.attach();
            let data = blaster.readback(offset, length)?;
            match out {
                Some(path) => {
                    fs::write(&path, &data)?;
                    log::info!("Saved {} bytes to {}", data.len(), path.display());
                }
                None => dump_hex(offset, &data),
            }
        }
        Commands::Erase { sectors } => {
            blaster.attach();
            blaster.erase(&sectors)?;
        }
        Commands::EraseFull => {
            blaster.attach();
            blaster.erase_full()?;
        }
        Commands::Program {
            flash_offset,
            work_offset,
            length,
        } => {
            blaster.attach();
            blaster.program(flash_offset, work_offset, length)?;
            log::info!("Programmed {:#x} bytes at {:#010x}", length, flash_offset);
        }
        Commands::Flash {
            path,
            bootloader,
            reset,
        } => {
            let image = format::read_firmware_from_file(path, 0)?;
            log::info!("Firmware size: {}", image.data.len());
            match bootloader {
                Some(bootloader) => {
                    let loader =
                        format::read_firmware_from_file(bootloader, blaster.chip().load_address)?;
                    connect(&mut blaster, cli.no_reset)?;
                    blaster.bootstrap(&loader)?;
                }
                None => blaster.attach(),
            }
            blaster.flash_image(&image)?;
            if reset {
                blaster.reset()?;
            }
        }
        Commands::Reset => {
            blaster.attach();
            blaster.reset()?;
        }
        Commands::ExitIsp => {
            blaster.attach();
            blaster.exit_to_isp()?;
        }
        Commands::Ports
        | Commands::Chips
        | Commands::Encode { .. }
        | Commands::Emulate => unreachable!(),
    }

    Ok(())
}

fn connect<T: Transport>(blaster: &mut Blaster<T>, no_reset: bool) -> Result<()> {
    if !no_reset {
        blaster.enter_isp()?;
    }
    blaster.connect_isp()
}

fn emulate(cli: &Cli) -> Result<()> {
    let chip = ChipDB::find_chip(&cli.chip)?;
    let port = match &cli.port {
        Some(port) => SerialTransport::open(port, cli.baudrate)?,
        None => SerialTransport::open_any(cli.baudrate)?,
    };
    log::info!("Emulating LPCBlaster on {}", chip);

    let target = SimulatedTarget::new(chip.sectors.clone());
    let mut bootloader = Bootloader::new(port, target, BootloaderConfig::from(&chip));
    loop {
        match bootloader.run() {
            Halt::Reset => log::info!("reset requested, restarting"),
            Halt::ExitToLoader => log::info!("exit to ISP requested, restarting"),
            Halt::LinkClosed => return Ok(()),
        }
    }
}

fn dump_hex(address: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let addr = address as usize + 16 * i;
        print!("{addr:08x}");
        for (b, byte) in row.iter().enumerate() {
            if b % 8 == 0 {
                print!(" ");
            }
            print!(" {byte:02x}");
        }
        println!();
    }
}
