//! The host's view of the serial link, free of any I/O.
//!
//! Bytes from the device go in through [`Session::on_data`]; bytes for the
//! device collect in an outbox drained with [`Session::take_output`], and
//! finished work is reported as [`Event`]s. The link starts in the ISP line
//! protocol and switches to the bootloader's binary protocol once the
//! bootloader has announced itself.
//!
//! At most one ISP command is active. When it finishes, the next command of
//! its chain is only queued; [`Session::run_pending`] starts it, so a
//! continuation never runs from inside the handler of its predecessor.

use std::collections::VecDeque;

use anyhow::Result;

use crate::blaster::{Reply, ReplyDecoder};
use crate::command::{HostCommand, Output, Progress};
use crate::isp::Handshake;
use crate::protocol::Request;

/// Commands run one after another, each only once the previous one is done.
#[derive(Debug, Default)]
pub struct Chain {
    commands: VecDeque<Box<dyn HostCommand>>,
}

impl Chain {
    pub fn new(first: impl HostCommand + 'static) -> Self {
        Chain::default().then(first)
    }

    pub fn then(mut self, next: impl HostCommand + 'static) -> Self {
        self.commands.push_back(Box::new(next));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug)]
pub enum Event {
    Established,
    Completed { command: String, output: Output },
    /// The command failed and the rest of its chain was dropped.
    Failed { command: String, error: anyhow::Error },
    BlasterReady,
    Reply(Reply),
    /// The binary protocol lost sync with the device.
    ProtocolError(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Nothing sent yet, or the link was closed.
    Closed,
    Handshake,
    /// ISP connection established, no command running.
    Idle,
    Command,
    /// The bootloader is running and speaks its binary protocol.
    Blaster,
}

#[derive(Debug)]
pub struct Session {
    mode: Mode,
    handshake: Handshake,
    line: Vec<u8>,
    active: Option<Box<dyn HostCommand>>,
    chain: VecDeque<Box<dyn HostCommand>>,
    decoder: Option<ReplyDecoder>,
    outbox: Vec<u8>,
    events: VecDeque<Event>,
}

impl Session {
    /// `frequency_khz` is the crystal frequency reported to the ISP.
    pub fn new(frequency_khz: u32) -> Self {
        Session {
            mode: Mode::Closed,
            handshake: Handshake::new(frequency_khz),
            line: vec![],
            active: None,
            chain: VecDeque::new(),
            decoder: None,
            outbox: vec![],
            events: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether a command or a binary request is waiting for the device.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.decoder.is_some()
    }

    /// Whether continuations are queued.
    pub fn has_pending(&self) -> bool {
        !self.chain.is_empty()
    }

    /// Starts the ISP handshake from scratch.
    pub fn open(&mut self) {
        self.discard_work();
        self.line.clear();
        self.mode = Mode::Handshake;
        let out = self.handshake.start();
        self.outbox.extend(out);
    }

    /// Assumes the bootloader is already running on the other end.
    pub fn attach_blaster(&mut self) {
        self.discard_work();
        self.line.clear();
        self.mode = Mode::Blaster;
    }

    /// Drops the active command, its chain and any in-flight request.
    pub fn close(&mut self) {
        self.discard_work();
        self.line.clear();
        self.mode = Mode::Closed;
    }

    fn discard_work(&mut self) {
        if let Some(cmd) = self.active.take() {
            log::debug!("discarding {}", cmd.describe());
        }
        self.chain.clear();
        self.decoder = None;
    }

    /// Starts a chain. Only valid on an established, idle ISP connection.
    pub fn run(&mut self, chain: Chain) -> Result<()> {
        anyhow::ensure!(
            self.mode == Mode::Idle,
            "cannot run ISP commands in {:?} mode",
            self.mode
        );
        anyhow::ensure!(!chain.is_empty(), "empty command chain");
        self.chain = chain.commands;
        self.run_pending();
        Ok(())
    }

    /// Starts the next queued command if nothing is active. Returns whether
    /// one was started.
    pub fn run_pending(&mut self) -> bool {
        if self.mode != Mode::Idle || self.active.is_some() {
            return false;
        }
        let Some(mut next) = self.chain.pop_front() else {
            return false;
        };
        log::debug!("starting {}", next.describe());
        next.start(&mut self.outbox);
        self.active = Some(next);
        self.mode = Mode::Command;
        true
    }

    /// Sends a request to the bootloader.
    pub fn send_request(&mut self, request: Request) -> Result<()> {
        anyhow::ensure!(
            self.mode == Mode::Blaster,
            "bootloader is not running ({:?} mode)",
            self.mode
        );
        anyhow::ensure!(
            self.decoder.is_none(),
            "a request is already waiting for its reply"
        );
        let decoder = ReplyDecoder::for_request(&request);
        let raw = request.into_raw()?;
        self.decoder = decoder;
        log::debug!("=> {}", hex::encode(&raw[..raw.len().min(32)]));
        self.outbox.extend(raw);
        Ok(())
    }

    /// The request in flight, if any.
    pub fn pending_reply(&self) -> Option<&ReplyDecoder> {
        self.decoder.as_ref()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbox)
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Feeds bytes received from the device.
    pub fn on_data(&mut self, data: &[u8]) {
        for &byte in data {
            if self.mode == Mode::Blaster {
                self.on_binary(byte);
                continue;
            }
            self.line.push(byte);
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.on_line(&line);
            }
        }
    }

    fn on_line(&mut self, line: &[u8]) {
        log::debug!("<= {:?}", String::from_utf8_lossy(line));
        match self.mode {
            Mode::Handshake => {
                let out = self.handshake.on_line(line);
                self.outbox.extend(out);
                if self.handshake.is_established() {
                    self.mode = Mode::Idle;
                    self.events.push_back(Event::Established);
                }
            }
            Mode::Command => self.on_command_line(line),
            Mode::Closed | Mode::Idle | Mode::Blaster => {
                log::info!("device: {}", String::from_utf8_lossy(line).trim_end());
            }
        }
    }

    fn on_command_line(&mut self, line: &[u8]) {
        let Some(cmd) = self.active.as_mut() else {
            return;
        };
        match cmd.on_line(line, &mut self.outbox) {
            Ok(Progress::Pending) => {}
            Ok(Progress::Done(output)) => {
                let command = cmd.describe();
                log::debug!("{} done", command);
                self.active = None;
                self.mode = Mode::Idle;
                if output == Output::BlasterReady {
                    // whatever was queued was meant for the ISP
                    self.chain.clear();
                    self.mode = Mode::Blaster;
                    self.events.push_back(Event::BlasterReady);
                }
                self.events.push_back(Event::Completed { command, output });
            }
            Err(error) => {
                let command = cmd.describe();
                log::warn!("{} failed: {}", command, error);
                self.active = None;
                self.chain.clear();
                self.mode = Mode::Idle;
                self.events.push_back(Event::Failed { command, error });
            }
        }
    }

    fn on_binary(&mut self, byte: u8) {
        let Some(decoder) = self.decoder.as_mut() else {
            log::warn!("unsolicited byte 0x{:02x} from the bootloader", byte);
            return;
        };
        match decoder.push(byte) {
            Ok(None) => {}
            Ok(Some(reply)) => {
                self.decoder = None;
                self.events.push_back(Event::Reply(reply));
            }
            Err(error) => {
                self.decoder = None;
                self.events.push_back(Event::ProtocolError(error));
            }
        }
    }
}
