//! Blocking driver: pumps a [`Session`] over a [`Transport`].

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Result;
use indicatif::ProgressBar;

use crate::blaster::Reply;
use crate::command::{Output, ReadCommand, RunCommand, UnlockCommand, WriteCommand};
use crate::constants::FLASH_PAGE_SIZE;
use crate::format::FirmwareImage;
use crate::protocol::Request;
use crate::session::{Chain, Event, Session};
use crate::transport::{Baudrate, SerialTransport};
use crate::{Chip, Transport};

/// Reset pulse width and the time the ROM needs afterwards.
const RESET_PULSE: Duration = Duration::from_millis(100);
/// Largest `L` payload sent in one request.
const LOAD_BLOCK: usize = 1024;

pub struct Blaster<T: Transport> {
    transport: T,
    session: Session,
    chip: Chip,
    timeout: Duration,
}

impl Blaster<SerialTransport> {
    pub fn open_serial(
        port: Option<&str>,
        baudrate: Baudrate,
        chip: Chip,
        timeout: Duration,
    ) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port, baudrate)?,
            None => SerialTransport::open_any(baudrate)?,
        };
        Ok(Blaster::new(transport, chip, timeout))
    }
}

impl<T: Transport> Blaster<T> {
    pub fn new(transport: T, chip: Chip, timeout: Duration) -> Self {
        let session = Session::new(chip.isp_frequency_khz);
        Blaster {
            transport,
            session,
            chip,
            timeout,
        }
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn dump_info(&self) {
        log::info!(
            "Chip: {} (Flash: {}KiB, staging {:#010x} +{}KiB)",
            self.chip,
            self.chip.flash_size / 1024,
            self.chip.staging_address,
            self.chip.staging_size / 1024
        );
    }

    /// Holds boot-select and pulses reset so the ROM starts its ISP.
    pub fn enter_isp(&mut self) -> Result<()> {
        self.transport.set_boot(true)?;
        self.pulse_reset()?;
        log::debug!("reset into ISP");
        Ok(())
    }

    /// Releases boot-select and pulses reset to start the application.
    pub fn reset_to_application(&mut self) -> Result<()> {
        self.transport.set_boot(false)?;
        self.pulse_reset()?;
        log::info!("Device reset");
        Ok(())
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.transport.set_reset(true)?;
        sleep(RESET_PULSE);
        self.transport.set_reset(false)?;
        sleep(RESET_PULSE);
        Ok(())
    }

    /// Runs the ISP handshake.
    pub fn connect_isp(&mut self) -> Result<()> {
        self.transport.clear_input()?;
        self.session.open();
        self.wait_for(None, |_, event| match event {
            Event::Established => Some(Ok(())),
            _ => None,
        })?;
        log::info!("Connected to the {} ISP", self.chip.family);
        Ok(())
    }

    /// Assumes the bootloader is already running.
    pub fn attach(&mut self) {
        self.session.attach_blaster();
    }

    pub fn isp_read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        match self.run_chain(Chain::new(ReadCommand::new(offset, length)?))? {
            Output::Data { bytes, .. } => Ok(bytes),
            other => anyhow::bail!("read finished without data: {:?}", other),
        }
    }

    pub fn isp_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let mut data = data.to_vec();
        data.resize(data.len().next_multiple_of(4), 0);
        self.run_chain(Chain::new(WriteCommand::new(offset, data)?))?;
        Ok(())
    }

    /// Writes the bootloader into ISP RAM, unlocks and runs it, and waits
    /// until it reports ready.
    pub fn bootstrap(&mut self, image: &FirmwareImage) -> Result<()> {
        let mut image = image.clone();
        image.pad_to(FLASH_PAGE_SIZE as usize, 0);
        let entry = image.entry & !1;
        log::info!(
            "Bootstrapping {} bytes at {:#010x}, entry {:#010x}",
            image.data.len(),
            image.base,
            entry
        );

        let chain = Chain::new(WriteCommand::new(image.base, image.data)?)
            .then(UnlockCommand::new())
            .then(RunCommand::new(entry)?);
        match self.run_chain(chain)? {
            Output::BlasterReady => {
                log::info!("LPCBlaster ready");
                Ok(())
            }
            other => anyhow::bail!("bootloader did not start: {:?}", other),
        }
    }

    /// Runs a chain to its end. Returns the output of its last command.
    fn run_chain(&mut self, chain: Chain) -> Result<Output> {
        self.session.run(chain)?;
        self.wait_for(None, |session, event| match event {
            Event::Completed { command, output } => {
                log::debug!("{} completed", command);
                if session.has_pending() {
                    None
                } else {
                    Some(Ok(output))
                }
            }
            Event::Failed { error, .. } => Some(Err(error)),
            _ => None,
        })
    }

    /// Sends a request and waits for its reply, turning a NAK into an error.
    fn transfer(&mut self, request: Request, progress: Option<&ProgressBar>) -> Result<Reply> {
        anyhow::ensure!(request.expects_reply(), "{:?} is never answered", request.opcode());
        self.session.send_request(request)?;
        let reply = self.wait_for(progress, |_, event| match event {
            Event::Reply(reply) => Some(Ok(reply)),
            Event::ProtocolError(error) => Some(Err(error)),
            _ => None,
        })?;
        reply.into_result()
    }

    /// Copies `data` into the staging buffer at `offset`.
    pub fn load(&mut self, offset: u16, data: &[u8]) -> Result<()> {
        self.transfer(
            Request::Load {
                offset,
                data: data.to_vec(),
            },
            None,
        )?;
        Ok(())
    }

    pub fn zero(&mut self, offset: u16, length: u16) -> Result<()> {
        self.transfer(Request::Zero { offset, length }, None)?;
        Ok(())
    }

    pub fn readback(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let bar = ProgressBar::new(length as u64);
        let reply = self.transfer(Request::Readback { offset, length }, Some(&bar))?;
        bar.finish();
        match reply {
            Reply::Readback { data, .. } => Ok(data),
            other => anyhow::bail!("unexpected reply to readback: {:?}", other),
        }
    }

    pub fn erase(&mut self, sectors: &[u8]) -> Result<()> {
        self.transfer(
            Request::EraseSectors {
                sectors: sectors.to_vec(),
            },
            None,
        )?;
        log::info!("Erased sectors {:?}", sectors);
        Ok(())
    }

    pub fn erase_full(&mut self) -> Result<()> {
        self.transfer(Request::EraseFull, None)?;
        log::info!("Flash erased");
        Ok(())
    }

    /// Erases the sectors under `[flash_offset, flash_offset + length]` and
    /// programs them from the staging buffer.
    pub fn program(&mut self, flash_offset: u32, work_offset: u16, length: u16) -> Result<()> {
        self.transfer(
            Request::EraseAndProgram {
                flash_offset,
                work_offset,
                length,
            },
            None,
        )?;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.send_only(Request::Reset)?;
        log::info!("Device reset");
        Ok(())
    }

    /// Leaves the bootloader for the ROM ISP; a new handshake is needed.
    pub fn exit_to_isp(&mut self) -> Result<()> {
        self.send_only(Request::ExitToLoader)?;
        self.session.close();
        log::info!("Returned to ISP");
        Ok(())
    }

    fn send_only(&mut self, request: Request) -> Result<()> {
        self.session.send_request(request)?;
        self.flush()
    }

    /// Programs a whole image through the staging buffer, one batch of
    /// sectors at a time, and reads every batch back.
    pub fn flash_image(&mut self, image: &FirmwareImage) -> Result<()> {
        let batches = self.plan_batches(image)?;

        let bar = ProgressBar::new(image.data.len() as u64);
        for (flash_offset, length) in batches {
            let start = (flash_offset - image.base) as usize;
            let end = (start + length as usize).min(image.data.len());
            let mut chunk = image.data[start..end].to_vec();
            chunk.resize(length as usize, 0xff);

            for (i, block) in chunk.chunks(LOAD_BLOCK).enumerate() {
                self.load((i * LOAD_BLOCK) as u16, block)?;
            }
            self.program(flash_offset, 0, length as u16)?;

            let written = self.readback(flash_offset, length)?;
            if written != chunk {
                let at = written.iter().zip(&chunk).position(|(a, b)| a != b).unwrap_or(0);
                anyhow::bail!("verify failed at {:#010x}", flash_offset as usize + at);
            }
            bar.inc((end - start) as u64);
        }
        bar.finish();
        log::info!("Programmed and verified {} bytes", image.data.len());
        Ok(())
    }

    /// Splits the image into `(flash_offset, length)` batches made of whole
    /// sectors that each fit the staging buffer.
    fn plan_batches(&self, image: &FirmwareImage) -> Result<Vec<(u32, u32)>> {
        anyhow::ensure!(!image.data.is_empty(), "empty image");
        // staging offsets and lengths travel as u16
        let capacity = self.chip.staging_size;
        anyhow::ensure!(
            capacity <= u16::MAX as u32,
            "staging buffer of {}KiB cannot be addressed with 16-bit offsets",
            capacity / 1024
        );
        let sectors = &self.chip.sectors;
        let first = sectors
            .find_sector_for_address(image.base)
            .ok_or_else(|| anyhow::format_err!("image base {:#010x} is not in flash", image.base))?;
        anyhow::ensure!(
            sectors.sectors()[first as usize].start_address == image.base,
            "image base {:#010x} is not at a sector start",
            image.base
        );
        // the sector after the image end is erased along with the image
        anyhow::ensure!(
            image.end().next_multiple_of(FLASH_PAGE_SIZE as u64) < sectors.flash_size(),
            "image ends at {:#010x}, programming needs one more sector after it",
            image.end()
        );

        let mut batches: Vec<(u32, u32)> = vec![];
        for sector in &sectors.sectors()[first as usize..] {
            if sector.start_address as u64 >= image.end() {
                break;
            }
            anyhow::ensure!(
                sector.length <= capacity,
                "sector at {:#010x} ({}KiB) does not fit the {}KiB staging buffer",
                sector.start_address,
                sector.length / 1024,
                capacity / 1024
            );
            match batches.last_mut() {
                Some((_, length)) if *length + sector.length <= capacity => *length += sector.length,
                _ => batches.push((sector.start_address, sector.length)),
            }
        }

        // no need to program the erased tail of the last batch
        if let Some((start, length)) = batches.last_mut() {
            let used = (image.end() - *start as u64) as u32;
            *length = used.next_multiple_of(FLASH_PAGE_SIZE).min(*length);
        }
        Ok(batches)
    }

    fn flush(&mut self) -> Result<()> {
        let out = self.session.take_output();
        if !out.is_empty() {
            log::trace!("=> {}", hex::encode(&out[..out.len().min(64)]));
            self.transport.send_raw(&out)?;
        }
        Ok(())
    }

    /// Runs the event loop until `select` picks a result out of an event.
    /// Gives up after `timeout` without any data from the device.
    fn wait_for<R>(
        &mut self,
        progress: Option<&ProgressBar>,
        mut select: impl FnMut(&Session, Event) -> Option<Result<R>>,
    ) -> Result<R> {
        let mut deadline = Instant::now() + self.timeout;
        loop {
            self.flush()?;
            while let Some(event) = self.session.poll_event() {
                if let Some(result) = select(&self.session, event) {
                    self.flush()?;
                    return result;
                }
            }
            if self.session.run_pending() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                anyhow::bail!(
                    "no answer from the device within {:?} ({:?} mode)",
                    self.timeout,
                    self.session.mode()
                );
            }
            let data = self.transport.recv_raw(deadline - now)?;
            if data.is_empty() {
                continue;
            }
            deadline = Instant::now() + self.timeout;
            log::trace!("<= {}", hex::encode(&data[..data.len().min(64)]));
            self.session.on_data(&data);

            if let Some(bar) = progress
                && let Some(readback) = self.session.pending_reply().and_then(|d| d.readback())
            {
                bar.set_position(readback.progress().0 as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChipDB;

    struct Silent;

    impl Transport for Silent {
        fn send_raw(&mut self, _raw: &[u8]) -> Result<()> {
            Ok(())
        }

        fn recv_raw(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn blaster(chip: Chip) -> Blaster<Silent> {
        Blaster::new(Silent, chip, Duration::from_millis(10))
    }

    fn image(base: u32, len: usize) -> FirmwareImage {
        FirmwareImage {
            base,
            data: vec![0x5a; len],
            entry: base,
        }
    }

    #[test]
    fn batches_fill_the_staging_buffer() {
        let b = blaster(ChipDB::find_chip("LPC1768").unwrap());
        assert_eq!(
            b.plan_batches(&image(0, 40 * 1024 + 100)).unwrap(),
            [(0, 0x8000), (0x8000, 0x2100)]
        );
        // 32K sectors go one per batch
        assert_eq!(
            b.plan_batches(&image(0x1_0000, 0x9000)).unwrap(),
            [(0x1_0000, 0x8000), (0x1_8000, 0x1000)]
        );
    }

    #[test]
    fn batches_need_a_sector_start_and_a_spare_sector() {
        let b = blaster(ChipDB::find_chip("LPC1768").unwrap());
        assert!(b.plan_batches(&image(0x100, 0x100)).is_err());
        assert!(b.plan_batches(&image(0x7_8000, 0x8000)).is_err());
        assert!(b.plan_batches(&image(0x7_8000, 0x7f00)).is_ok());
    }

    #[test]
    fn staging_larger_than_u16_offsets_is_refused() {
        let mut chip = ChipDB::find_chip("LPC1768").unwrap();
        chip.staging_size = 64 * 1024;
        let err = blaster(chip).plan_batches(&image(0, 0x1000)).unwrap_err();
        assert!(err.to_string().contains("16-bit"));
    }
}
