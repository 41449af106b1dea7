//! Simulated SD card answering SPI mode traffic byte by byte.

use crate::{lock_mask, DefaultSdLockerConfig, SdLocker, SdLockerConfig};

use core::convert::Infallible;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal_mock::{pin, spi};
use std::{cell::RefCell, collections::VecDeque, iter, rc::Rc};
use switch_hal::{ActiveLow, IntoSwitch, OutputSwitch, Switch};

const ILLEGAL_COMMAND: u8 = 0x04;
const PARAMETER_ERROR: u8 = 0x40;

const SDHC_CSD: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3B, 0x37, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x00,
];
const SD_CSD: [u8; 16] = [
    0x00, 0x2E, 0x00, 0x32, 0x5B, 0x5A, 0x83, 0xA9, 0xFF, 0xFF, 0xFF, 0x80, 0x16, 0x80, 0x00, 0x00,
];
const CID: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x12, 0x34, 0x56, 0x78, 0x00, 0xC2, 0x01,
];

/// CRC7 computed bit by bit.
pub fn crc7_bitwise(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        for bit in (0..8).rev() {
            let feedback = ((byte >> bit) & 1) ^ ((crc >> 6) & 1);
            crc = (crc << 1) & 0x7F;
            if feedback != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

/// CRC16-CCITT computed bit by bit.
pub fn crc16_bitwise(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Nothing on the bus.
    Absent,
    HighCapacity,
    StandardCapacity,
    /// Answers GO_IDLE_STATE, rejects both capacity checks.
    Unrecognized,
}

/// Command frame as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u8,
    pub arg: u32,
    pub bytes: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Csd,
    Lock,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Command(Vec<u8>),
    AwaitToken(Target),
    Data(Target, Vec<u8>),
    Crc(usize),
}

pub struct SimCard {
    pub kind: SimKind,
    /// Fill bytes before every response.
    pub ncr: usize,
    /// Initialization poll answering ready.
    pub ready_after: usize,
    pub csd: [u8; 16],
    pub initial_csd: [u8; 16],
    pub cid: [u8; 16],
    pub ocr: [u8; 4],
    pub csd_writable: bool,
    pub password: Option<Vec<u8>>,
    pub locked: bool,
    /// Count of coming CMD42 payloads accepted but not acted on.
    pub rejected_lock_payloads: usize,
    pub erase_works: bool,
    pub read_error_token: Option<u8>,
    /// Fill bytes before a start or error token.
    pub token_delay: usize,
    pub withhold_data: bool,
    pub corrupt_data_crc: bool,
    pub busy_cycles: usize,
    pub stuck_busy: bool,

    pub frames: Vec<Frame>,
    pub csd_writes: Vec<[u8; 16]>,
    pub lock_payloads: Vec<Vec<u8>>,
    /// Exchanges since the last data payload completed, until deselected.
    pub trailing: usize,

    selected: bool,
    counting: bool,
    holding_busy: bool,
    idle: bool,
    app_cmd: bool,
    init_polls: usize,
    block_len: usize,
    phase: Phase,
    out: VecDeque<u8>,
}

impl SimCard {
    pub fn new(kind: SimKind) -> Self {
        let mut csd = match kind {
            SimKind::HighCapacity => SDHC_CSD,
            _ => SD_CSD,
        };
        csd[15] = (crc7_bitwise(&csd[..15]) << 1) | 1;

        let ocr = match kind {
            SimKind::HighCapacity => [0xC0, 0xFF, 0x80, 0x00],
            _ => [0x80, 0xFF, 0x80, 0x00],
        };

        SimCard {
            kind,
            ncr: 1,
            ready_after: 3,
            csd,
            initial_csd: csd,
            cid: CID,
            ocr,
            csd_writable: true,
            password: None,
            locked: false,
            rejected_lock_payloads: 0,
            erase_works: true,
            read_error_token: None,
            token_delay: 1,
            withhold_data: false,
            corrupt_data_crc: false,
            busy_cycles: 2,
            stuck_busy: false,
            frames: Vec::new(),
            csd_writes: Vec::new(),
            lock_payloads: Vec::new(),
            trailing: 0,
            selected: false,
            counting: false,
            holding_busy: false,
            idle: false,
            app_cmd: false,
            init_polls: 0,
            block_len: 512,
            phase: Phase::Idle,
            out: VecDeque::new(),
        }
    }

    /// Card already protected by `password`.
    pub fn locked_with(mut self, password: &[u8]) -> Self {
        self.password = Some(password.to_vec());
        self.locked = true;
        self
    }

    /// Content served for a read at `arg`.
    pub fn block_content(arg: u32) -> Vec<u8> {
        (0..512u32).map(|i| (i ^ arg) as u8).collect()
    }

    /// Frames received with this command index.
    pub fn count(&self, index: u8) -> usize {
        self.frames.iter().filter(|frame| frame.index == index).count()
    }

    fn deselect(&mut self) {
        self.selected = false;
        self.counting = false;
        self.holding_busy = false;
        self.phase = Phase::Idle;
        self.out.clear();
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }

        let idle_level = if self.holding_busy { 0x00 } else { 0xFF };
        let miso = self.out.pop_front().unwrap_or(idle_level);

        if self.counting {
            self.trailing += 1;
        }

        self.consume(mosi);
        miso
    }

    fn consume(&mut self, mosi: u8) {
        self.phase = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle if mosi & 0xC0 == 0x40 => Phase::Command(vec![mosi]),
            Phase::Idle => Phase::Idle,
            Phase::Command(mut bytes) => {
                bytes.push(mosi);
                if bytes.len() < 6 {
                    Phase::Command(bytes)
                } else {
                    self.command(&bytes)
                }
            }
            Phase::AwaitToken(target) if mosi == 0xFE => Phase::Data(target, Vec::new()),
            Phase::AwaitToken(target) => Phase::AwaitToken(target),
            Phase::Data(target, mut data) => {
                data.push(mosi);
                let len = match target {
                    Target::Csd => 16,
                    Target::Lock => self.block_len,
                };
                if data.len() < len {
                    Phase::Data(target, data)
                } else {
                    self.counting = true;
                    self.trailing = 0;
                    self.payload(target, data);
                    Phase::Crc(2)
                }
            }
            Phase::Crc(left) if left > 1 => Phase::Crc(left - 1),
            Phase::Crc(_) => {
                if self.stuck_busy {
                    self.holding_busy = true;
                } else {
                    self.out.extend(iter::repeat(0x00).take(self.busy_cycles));
                }
                Phase::Idle
            }
        };
    }

    fn r1(&self) -> u8 {
        u8::from(self.idle)
    }

    fn init_poll(&mut self) -> u8 {
        self.init_polls += 1;
        if self.init_polls >= self.ready_after {
            self.idle = false;
        }
        self.r1()
    }

    fn data_block(&self, data: &[u8]) -> Vec<u8> {
        let mut reply = vec![self.r1()];
        if self.withhold_data {
            return reply;
        }

        let crc = crc16_bitwise(data) ^ if self.corrupt_data_crc { 0xFFFF } else { 0 };

        reply.extend(iter::repeat(0xFF).take(self.token_delay));
        reply.push(0xFE);
        reply.extend_from_slice(data);
        reply.extend(crc.to_be_bytes());
        reply
    }

    fn command(&mut self, bytes: &[u8]) -> Phase {
        let frame = Frame {
            index: bytes[0] & 0x3F,
            arg: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            bytes: [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]],
        };
        self.frames.push(frame.clone());

        if self.kind == SimKind::Absent {
            return Phase::Idle;
        }

        let app_cmd = std::mem::replace(&mut self.app_cmd, false);
        let mut next = Phase::Idle;

        let reply = match frame.index {
            0 => {
                self.idle = true;
                self.init_polls = 0;
                self.block_len = 512;
                vec![self.r1()]
            }
            8 if self.kind == SimKind::HighCapacity => vec![self.r1(), 0x00, 0x00, 0x01, 0xAA],
            58 if self.kind != SimKind::Unrecognized => {
                let mut reply = vec![self.r1()];
                reply.extend(self.ocr);
                reply
            }
            1 if self.kind == SimKind::StandardCapacity => vec![self.init_poll()],
            41 if app_cmd && self.kind == SimKind::HighCapacity => vec![self.init_poll()],
            55 => {
                self.app_cmd = true;
                vec![self.r1()]
            }
            9 => self.data_block(&self.csd),
            10 => self.data_block(&self.cid),
            13 => vec![self.r1(), u8::from(self.locked)],
            16 if frame.arg >= 1 && frame.arg <= 512 => {
                self.block_len = frame.arg as usize;
                vec![self.r1()]
            }
            16 => vec![self.r1() | PARAMETER_ERROR],
            17 if self.locked => vec![self.r1() | ILLEGAL_COMMAND],
            17 => match self.read_error_token {
                Some(token) => {
                    let mut reply = vec![self.r1()];
                    reply.extend(iter::repeat(0xFF).take(self.token_delay));
                    reply.push(token);
                    reply
                }
                None => self.data_block(&Self::block_content(frame.arg)),
            },
            27 => {
                next = Phase::AwaitToken(Target::Csd);
                vec![self.r1()]
            }
            42 => {
                next = Phase::AwaitToken(Target::Lock);
                vec![self.r1()]
            }
            _ => vec![self.r1() | ILLEGAL_COMMAND],
        };

        self.out.extend(iter::repeat(0xFF).take(self.ncr));
        self.out.extend(reply);
        next
    }

    fn payload(&mut self, target: Target, data: Vec<u8>) {
        match target {
            Target::Csd => {
                let mut written = [0; 16];
                written.copy_from_slice(&data);
                self.csd_writes.push(written);
                if self.csd_writable {
                    self.csd = written;
                }
            }
            Target::Lock => {
                self.lock_payloads.push(data.clone());
                if self.rejected_lock_payloads > 0 {
                    self.rejected_lock_payloads -= 1;
                } else {
                    self.apply_lock(&data);
                }
            }
        }
    }

    fn apply_lock(&mut self, data: &[u8]) {
        let mask = data[0];

        if mask & lock_mask::ERASE != 0 {
            if self.erase_works {
                self.locked = false;
                self.password = None;
            }
            return;
        }

        let len = data.get(1).map_or(0, |&len| usize::from(len));
        let given = data.get(2..2 + len).unwrap_or(&[]).to_vec();

        if mask & lock_mask::SET_PASSWORD != 0 {
            self.password = Some(given);
            self.locked = mask & lock_mask::LOCK_UNLOCK != 0;
            return;
        }

        if self.password.as_deref() != Some(&given[..]) {
            return;
        }

        if mask & lock_mask::CLEAR_PASSWORD != 0 {
            self.password = None;
            self.locked = false;
        } else {
            self.locked = mask & lock_mask::LOCK_UNLOCK != 0;
        }
    }
}

pub struct SimSpi(Rc<RefCell<SimCard>>);

impl Transfer<u8> for SimSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

pub struct SimCs(Rc<RefCell<SimCard>>);

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().selected = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().deselect();
        Ok(())
    }
}

pub type SimLocker<Config = DefaultSdLockerConfig> = SdLocker<SimSpi, SimCs, Config>;

pub fn sim_with_config<Config: SdLockerConfig>(
    card: SimCard,
) -> (SimLocker<Config>, Rc<RefCell<SimCard>>) {
    let card = Rc::new(RefCell::new(card));
    let locker = SdLocker::new(SimSpi(card.clone()), SimCs(card.clone()));

    (locker, card)
}

pub fn sim(card: SimCard) -> (SimLocker, Rc<RefCell<SimCard>>) {
    sim_with_config::<DefaultSdLockerConfig>(card)
}

pub type MockLocker = SdLocker<spi::Mock, Switch<pin::Mock, ActiveLow>, DefaultSdLockerConfig>;

/// One byte out, one byte in.
pub fn exchange(mosi: u8, miso: u8) -> spi::Transaction {
    spi::Transaction::transfer(vec![mosi], vec![miso])
}

/// Clocks around the select edge, the frame, and an R1 answered on the second poll.
pub fn command_exchanges(frame: [u8; 6], r1: u8) -> Vec<spi::Transaction> {
    let mut transactions = vec![exchange(0xFF, 0xFF), exchange(0xFF, 0xFF)];
    transactions.extend(frame.iter().map(|&byte| exchange(byte, 0xFF)));
    transactions.push(exchange(0xFF, 0xFF));
    transactions.push(exchange(0xFF, r1));
    transactions
}

/// Chip select levels in order, `true` for high (deselected).
pub fn cs_levels(levels: &[bool]) -> Vec<pin::Transaction> {
    levels
        .iter()
        .map(|&high| {
            pin::Transaction::set(if high {
                pin::State::High
            } else {
                pin::State::Low
            })
        })
        .collect()
}

pub fn mock_locker(
    spi_expectations: &[spi::Transaction],
    cs_expectations: &[pin::Transaction],
) -> (MockLocker, spi::Mock, pin::Mock) {
    let spi = spi::Mock::new(spi_expectations);
    let cs = pin::Mock::new(cs_expectations);
    let locker = SdLocker::new(spi.clone(), cs.clone().into_active_low_switch());

    (locker, spi, cs)
}
