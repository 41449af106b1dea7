//! SD card lock administration written in Embedded Rust, in the spirit of
//! [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate talks to an SD/SDHC card in SPI mode one byte at a time. It can
//! initialize the card, read its registers and single blocks, toggle the
//! temporary write protection bit of the CSD and drive the CMD42 password
//! protocol (set/clear password, lock, unlock, forced erase).
//!
//! Logging goes through [`log`](https://crates.io/crates/log) by default, or
//! through [`defmt`](https://crates.io/crates/defmt) with the `defmt-log`
//! feature (and default features off).

#![cfg_attr(not(test), no_std)]

mod actions;
mod config;
mod consts;
mod crc;
mod csd;
mod password;
mod response;
mod session;
#[cfg(test)]
mod testutils;

pub use crate::actions::{CardInfo, Indication, LockState};
pub use crate::config::{DefaultSdLockerConfig, SdLockerConfig};
pub use crate::consts::{lock_mask, BLOCK_SIZE};
pub use crate::crc::{Crc7Table, CRC7_TABLE};
pub use crate::csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2};
pub use crate::password::{Password, DEFAULT_PASSWORD, MAX_PASSWORD_LEN};
pub use crate::response::{CardStatus, DataErrorToken, R1Response};
pub use crate::session::{CardSession, Cid, Ocr};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    consts::{arguments, commands, frame_crc, tokens},
    crc::{crc16, CRC7_TABLE as CRC7},
    csd::CSD_CRC_INDEX,
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either log or defmt-log");

/// [`SdLocker`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// No card answered GO_IDLE_STATE.
    NotDetected,
    /// No response when executing this command.
    TimeoutCommand(u8),
    /// No data token arrived.
    TimeoutToken,
    /// The card stayed busy after programming.
    TimeoutBusy,
    /// Command error (command, R1 response).
    ErrorCommand(u8, u8),
    /// The card sent a token that is neither a start token nor an error token.
    UnexpectedToken(u8),
    /// The card sent a data error token instead of data.
    DataError(DataErrorToken),
    /// CRC mismatch (card, host).
    CrcError(u16, u16),
    /// Block number has no byte address on a standard capacity card.
    BlockOutOfRange(u32),
    /// The requested change is not visible when read back.
    NotConfirmed,
}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ErrorKind {
    /// SPI or chip select failure.
    Bus,
    /// No card on the bus.
    NotDetected,
    /// A poll ran out of attempts.
    Timeout,
    /// The card answered with something other than expected.
    Protocol,
    /// The card reported a data error token.
    Data,
    /// A change did not show up on read back.
    NotConfirmed,
}

impl<T, S> Error<T, S> {
    /// Error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::SelectError(_) => ErrorKind::Bus,
            Error::NotDetected => ErrorKind::NotDetected,
            Error::TimeoutCommand(_) | Error::TimeoutToken | Error::TimeoutBusy => {
                ErrorKind::Timeout
            }
            Error::ErrorCommand(..)
            | Error::UnexpectedToken(_)
            | Error::CrcError(..)
            | Error::BlockOutOfRange(_) => ErrorKind::Protocol,
            Error::DataError(_) => ErrorKind::Data,
            Error::NotConfirmed => ErrorKind::NotConfirmed,
        }
    }

    /// What the operator should be shown for this error.
    pub fn indication(&self) -> Indication {
        match self {
            Error::Transport(_)
            | Error::SelectError(_)
            | Error::NotDetected
            | Error::TimeoutCommand(_)
            | Error::TimeoutToken => Indication::NoCard,
            Error::NotConfirmed => Indication::NotConfirmed,
            _ => Indication::Rejected,
        }
    }
}

/// Card type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    /// Answered the idle handshake but neither capacity check.
    #[default]
    Unknown,
    /// SD v1, byte addressed.
    StandardCapacity,
    /// SDHC, block addressed.
    HighCapacity,
}

/// One data block.
pub type Block = [u8; BLOCK_SIZE];

/// Error type alias.
pub type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch, `on` selects the card.
/// `Config` - Config implementation of driver config trait.
pub struct SdLocker<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdLockerConfig> {
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    session: RefCell<CardSession>,
    password: Password,
    status: Status,
    config: PhantomData<Config>,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdLockerConfig> SdLocker<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdLocker<Spi, Cs, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        SdLocker {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            session: RefCell::new(CardSession::default()),
            password: Password::empty(),
            status: StatusFlag::NotInitialized.into(),
            config: PhantomData::<Config>,
        }
    }

    /// Release the SPI and the chip select.
    pub fn free(self) -> (Spi, Cs) {
        (self.spi.into_inner(), self.cs.into_inner())
    }

    /// Snapshot of what is known about the card.
    pub fn session(&self) -> CardSession {
        *self.session.borrow()
    }

    /// Card type found by the last initialization.
    pub fn card_type(&self) -> CardType {
        self.session.borrow().card_type
    }

    /// Validate buffer for read.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialzed.
    fn validate_initialized(&self) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(DiskioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Delay.
    fn delay(cycles: usize) {
        for i in 0..cycles {
            unsafe { core::ptr::read_volatile(&i) };
        }
    }

    /// Block number to the address CMD17 expects.
    fn block_address(&self, block: u32) -> Result<u32, ErrorFor<Self>> {
        match self.card_type() {
            CardType::StandardCapacity => block
                .checked_mul(BLOCK_SIZE as u32)
                .ok_or(Error::BlockOutOfRange(block)),
            CardType::HighCapacity | CardType::Unknown => Ok(block),
        }
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn deselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        self.transfer(tokens::IDLE)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Self>> {
        self.transfer(data).map(|_| ())
    }

    /// Eight clocks with the line idle.
    fn clock(&self) -> Result<(), ErrorFor<Self>> {
        self.receive().map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Invalidate the session registers when `result` is an error.
    fn tracked<R>(&self, result: Result<R, ErrorFor<Self>>) -> Result<R, ErrorFor<Self>> {
        if result.is_err() {
            self.session.borrow_mut().invalidate();
        }

        result
    }

    /// Run a register read, keeping its session slot in step with the result.
    fn refresh<R, F, G>(&self, read: F, slot: G) -> Result<R, ErrorFor<Self>>
    where
        R: Copy,
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
        G: Fn(&mut CardSession) -> &mut Option<R>,
    {
        *slot(&mut *self.session.borrow_mut()) = None;

        let value = self.tracked(read(self))?;
        *slot(&mut *self.session.borrow_mut()) = Some(value);

        Ok(value)
    }

    /// Check a command response.
    fn expect_r1(
        &self,
        cmd: u8,
        r1: R1Response,
        expected: R1Response,
    ) -> Result<(), ErrorFor<Self>> {
        if !r1.is_valid() {
            Err(Error::TimeoutCommand(cmd))
        } else if r1 != expected {
            warn!(
                "Wrong response from CMD{}: 0x{:02X}",
                cmd - commands::CMD_BASE,
                r1.raw()
            );
            Err(Error::ErrorCommand(cmd, r1.raw()))
        } else {
            Ok(())
        }
    }

    /// Wait for the first byte that is not idle, idle when none arrives.
    fn wait_for_token(&self) -> Result<u8, ErrorFor<Self>> {
        for _ in 0..Config::TOKEN_ATTEMPTS {
            let token = self.receive()?;

            if token != tokens::IDLE {
                return Ok(token);
            }
        }

        Ok(tokens::IDLE)
    }

    /// Wait for the start of a data block.
    fn read_start_token(&self) -> Result<(), ErrorFor<Self>> {
        match self.wait_for_token()? {
            tokens::DATA_START_BLOCK => Ok(()),
            tokens::IDLE => Err(Error::TimeoutToken),
            token => match DataErrorToken::decode(token) {
                Some(data_error) => {
                    warn!("SD data error token: 0x{:02X}", token);
                    Err(Error::DataError(data_error))
                }
                None => {
                    warn!("SD unexpected token: 0x{:02X}", token);
                    Err(Error::UnexpectedToken(token))
                }
            },
        }
    }

    /// Read data.
    fn read_data(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        self.read_start_token()?;
        self.receive_slice(data)?;

        let card_crc = (u16::from(self.receive()?) << 8) | u16::from(self.receive()?);

        if Config::VERIFY_DATA_CRC {
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Wait until the card releases the line after programming.
    fn wait_not_busy(&self) -> Result<(), ErrorFor<Self>> {
        for _ in 0..Config::BUSY_ATTEMPTS {
            if self.receive()? != tokens::BUSY {
                return Ok(());
            }
        }

        error!("SD card still busy after {} polls", Config::BUSY_ATTEMPTS);
        Err(Error::TimeoutBusy)
    }

    /// Command frame: command, big-endian argument, CRC with stop bit.
    fn command_frame(cmd: u8, arg: u32) -> [u8; 6] {
        let crc = match cmd {
            commands::CMD0 => frame_crc::GO_IDLE,
            commands::CMD8 => frame_crc::SEND_IF_COND,
            _ => frame_crc::PLACEHOLDER,
        };

        [
            cmd | commands::CMD_BASE,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ]
    }

    /// Send command.
    ///
    /// Returns the R1 response as read; a response with the top bit set means
    /// the card never answered. Commands with a data phase leave the card
    /// selected.
    fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            let prefix = self.send_command(commands::CMD55, 0x0000_0000)?;

            if prefix.raw() > R1Response::IN_IDLE_STATE.raw() {
                return Ok(prefix);
            }
        }

        let cmd = cmd & !commands::ACMD_FLAG;

        self.deselect()?;
        self.clock()?;
        self.select()?;
        self.clock()?;

        self.send_slice(&Self::command_frame(cmd, arg))?;

        let mut r1 = R1Response::from(tokens::IDLE);
        for _ in 0..Config::READ_R1_ATTEMPTS {
            r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                break;
            }
        }

        debug!(
            "CMD{}(0x{:08X}) -> 0x{:02X}",
            cmd - commands::CMD_BASE,
            arg,
            r1.raw()
        );

        if !commands::has_data_phase(cmd) {
            self.deselect()?;
            self.clock()?;
        }

        Ok(r1)
    }

    /// Bring the card into idle state.
    fn enter_idle_state(&self) -> Result<(), ErrorFor<Self>> {
        for i in 0..Config::GO_IDLE_ATTEMPTS {
            let r1 = self.send_command(commands::CMD0, 0x0000_0000)?;

            if r1 == R1Response::IN_IDLE_STATE {
                return Ok(());
            }

            debug!(
                "No idle response from SD, attempt: {}, response: 0x{:02X}",
                i + 1,
                r1.raw()
            );
        }

        Err(Error::NotDetected)
    }

    /// Repeat an initialization command until the card leaves idle state.
    fn wait_ready(&self, cmd: u8, arg: u32) -> Result<(), ErrorFor<Self>> {
        for i in 0..Config::INIT_ATTEMPTS {
            if self.send_command(cmd, arg)? == R1Response::READY_STATE {
                debug!("SD ready after {} attempts", i + 1);
                return Ok(());
            }
        }

        warn!(
            "SD still initializing after {} attempts",
            Config::INIT_ATTEMPTS
        );
        Ok(())
    }

    /// Check SD type.
    fn check_type(&self) -> Result<CardType, ErrorFor<Self>> {
        info!("Checking SD type");

        if self.send_command(commands::CMD8, arguments::IF_COND)? == R1Response::IN_IDLE_STATE {
            let mut echo = Ocr::default();
            self.receive_slice(&mut echo)?;
            self.wait_ready(commands::ACMD41, arguments::HIGH_CAPACITY_SUPPORT)?;

            return Ok(CardType::HighCapacity);
        }

        if self.send_command(commands::CMD58, 0x0000_0000)? == R1Response::IN_IDLE_STATE {
            let mut ocr = Ocr::default();
            self.receive_slice(&mut ocr)?;
            self.wait_ready(commands::CMD1, 0x0000_0000)?;
            self.send_command(commands::CMD16, BLOCK_SIZE as u32)?;

            return Ok(CardType::StandardCapacity);
        }

        warn!("SD answered GO_IDLE_STATE but no capacity check");
        Ok(CardType::Unknown)
    }

    /// Initialization sequence.
    fn init_card(&self) -> Result<CardType, ErrorFor<Self>> {
        self.session.borrow_mut().reset();

        self.deselect()?;

        for _ in 0..Config::POWER_UP_CLOCKS {
            self.clock()?;
        }

        self.enter_idle_state()?;
        self.send_command(commands::CMD16, BLOCK_SIZE as u32)?;

        let card_type = self.check_type()?;
        self.clock()?;

        self.session.borrow_mut().card_type = card_type;
        Ok(card_type)
    }

    /// Initialize SD.
    ///
    /// Runs the full sequence every time, nothing is cached from an earlier
    /// call.
    pub fn initialize(&mut self) -> Result<CardType, ErrorFor<Self>> {
        info!("SD initialize started");

        let result = self.init_card();

        self.status = match &result {
            Ok(card_type) => {
                info!("SD successfully initialized, type: {:?}", card_type);
                Status::default()
            }
            Err(Error::NotDetected) => {
                error!("SD card not detected");
                StatusFlag::ErrorOccured | StatusFlag::NotInitialized
            }
            Err(_) => {
                error!("Failed to initialize SD");
                StatusFlag::ErrorOccured | StatusFlag::NotInitialized
            }
        };

        result
    }

    /// Read register.
    fn read_register(&self, cmd: u8, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(cmd, 0x0000_0000)?;

        if !r1.is_valid() {
            return Err(Error::TimeoutCommand(cmd));
        }

        self.read_data(data)
    }

    fn read_ocr_impl(&self) -> Result<Ocr, ErrorFor<Self>> {
        let mut ocr = Ocr::default();

        let r1 = self.send_command(commands::CMD58, 0x0000_0000)?;
        self.expect_r1(commands::CMD58, r1, R1Response::READY_STATE)?;

        self.receive_slice(&mut ocr)?;
        self.clock()?;

        Ok(ocr)
    }

    fn read_csd_impl(&self) -> Result<CsdData, ErrorFor<Self>> {
        let mut csd_data = CsdData::default();
        self.read_register(commands::CMD9, &mut csd_data)?;

        Ok(csd_data)
    }

    fn read_cid_impl(&self) -> Result<Cid, ErrorFor<Self>> {
        let mut cid = Cid::default();
        self.read_register(commands::CMD10, &mut cid)?;

        Ok(cid)
    }

    fn read_card_status_impl(&self) -> Result<CardStatus, ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD13, 0x0000_0000)?;

        if !r1.is_valid() {
            return Err(Error::TimeoutCommand(commands::CMD13));
        }

        let status = self.receive()?;
        self.clock()?;

        Ok(CardStatus::from_bytes([r1.raw(), status]))
    }

    /// Read the Operating Conditions Register.
    pub fn read_ocr(&self) -> Result<Ocr, ErrorFor<Self>> {
        self.refresh(Self::read_ocr_impl, |s| &mut s.ocr)
    }

    /// Read the Card Specific Data register.
    pub fn read_csd(&self) -> Result<CsdData, ErrorFor<Self>> {
        self.refresh(Self::read_csd_impl, |s| &mut s.csd)
    }

    /// Read the Card Identification register.
    pub fn read_cid(&self) -> Result<Cid, ErrorFor<Self>> {
        self.refresh(Self::read_cid_impl, |s| &mut s.cid)
    }

    /// Read the card status (R2). Bit 0 of the second byte is the password
    /// lock.
    pub fn read_card_status(&self) -> Result<CardStatus, ErrorFor<Self>> {
        self.refresh(Self::read_card_status_impl, |s| &mut s.status)
    }

    /// Read one data block.
    pub fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), ErrorFor<Self>> {
        buf.fill(0);

        let result = self
            .block_address(block)
            .and_then(|address| self.send_command(commands::CMD17, address))
            .and_then(|r1| self.expect_r1(commands::CMD17, r1, R1Response::READY_STATE))
            .and_then(|_| self.read_data(buf));

        self.tracked(result)
    }

    /// Program the CSD: start token, 15 data bytes, CRC7, dummy CRC16.
    fn program_csd(&self, csd_data: &CsdData) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD27, 0x0000_0000)?;
        self.expect_r1(commands::CMD27, r1, R1Response::READY_STATE)?;

        self.send(tokens::DATA_START_BLOCK)?;

        let mut crc = 0;
        for &byte in csd_data[..CSD_CRC_INDEX].iter() {
            self.send(byte)?;
            crc = CRC7.extend(crc, byte);
        }
        self.send((crc << 1) | 0x01)?;

        self.clock()?;
        self.clock()?;

        self.wait_not_busy()
    }

    /// Set or clear the temporary write protection bit of the CSD.
    ///
    /// The cached CSD is dropped afterwards, read it again to confirm.
    pub fn set_temporary_lock(&self, locked: bool) -> Result<(), ErrorFor<Self>> {
        info!("SD setting temporary lock: {}", locked);

        let csd_data = self.read_csd()?;
        let result = self.program_csd(&csd::with_temporary_lock(csd_data, locked));

        self.session.borrow_mut().csd = None;
        self.tracked(result)
    }
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdLockerConfig> DiskioDevice
    for SdLocker<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
        self.session.borrow_mut().reset();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        SdLocker::initialize(self)
            .map(|_| ())
            .map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        let first = u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)?;

        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let block: &mut Block = chunk
                .try_into()
                .map_err(|_| DiskioError::InvalidArgument)?;

            let number = u32::try_from(i)
                .ok()
                .and_then(|i| first.checked_add(i))
                .ok_or(DiskioError::InvalidArgument)?;

            self.read_block(number, block)
                .map_err(DiskioError::Hardware)?;
        }

        Ok(())
    }

    fn write(&self, _buf: &[u8], _lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        warn!("SD block writes are not supported");
        Err(DiskioError::NotSupported)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => Ok(()),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
