use crate::{
    consts::lock_mask,
    csd::{CapacityProvider, Csd},
    Block, CardStatus, CardType, Cid, CsdData, Error, ErrorFor, ErrorKind, Ocr, SdLocker,
    SdLockerConfig,
};

use embedded_hal::blocking::spi::Transfer;
use size::Size;
use switch_hal::OutputSwitch;

#[cfg(feature = "log")]
use log::{debug, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

/// Lock state, of the password lock or the temporary write protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum LockState {
    Unlocked,
    Locked,
}

impl LockState {
    /// `true` for [`LockState::Locked`].
    pub fn is_locked(&self) -> bool {
        *self == LockState::Locked
    }
}

impl From<bool> for LockState {
    fn from(locked: bool) -> Self {
        if locked {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }
}

/// Registers read by [`SdLocker::examine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub card_type: CardType,
    /// Some cards reject READ_OCR.
    pub ocr: Option<Ocr>,
    pub csd: CsdData,
    pub cid: Cid,
    pub status: CardStatus,
}

impl CardInfo {
    /// Decoded CSD.
    pub fn csd(&self) -> Csd {
        Csd::from(self.csd)
    }

    /// Card capacity from the CSD.
    pub fn capacity(&self) -> Size {
        self.csd().card_capacity()
    }

    /// Password lock from the card status.
    pub fn password_lock(&self) -> LockState {
        self.status.is_locked().into()
    }

    /// Temporary write protection from the CSD.
    pub fn temporary_lock(&self) -> LockState {
        self.csd().temporary_write_protection().into()
    }
}

/// What the operator is shown when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Indication {
    /// No card, or it does not respond.
    NoCard,
    /// The card answered but refused.
    Rejected,
    /// The change did not show up on read back.
    NotConfirmed,
}

impl Indication {
    /// 32 step blink pattern, most significant bit first.
    pub fn blink_pattern(&self) -> Option<u32> {
        match self {
            Indication::NoCard => Some(0xC800_C800),
            Indication::Rejected => Some(0xA500_0000),
            Indication::NotConfirmed => None,
        }
    }
}

/// Attempts of an operation under the double-attempt policy.
const ATTEMPTS: usize = 2;

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdLockerConfig> SdLocker<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Swallow card-level failures, keep bus failures.
    fn tolerate(result: Result<(), ErrorFor<Self>>) -> Result<(), ErrorFor<Self>> {
        match result {
            Err(error) if error.kind() != ErrorKind::Bus => {
                warn!("SD card refused the operation: {:?}", error.kind());
                Ok(())
            }
            result => result,
        }
    }

    fn password_lock_state(&self) -> Result<LockState, ErrorFor<Self>> {
        Ok(self.read_card_status()?.is_locked().into())
    }

    fn temporary_lock_bit(&self) -> Result<LockState, ErrorFor<Self>> {
        if self.read_ocr().is_err() {
            debug!("SD OCR not available");
        }

        let csd = Csd::from(self.read_csd()?);
        Ok(csd.temporary_write_protection().into())
    }

    /// Run `operation` until the password lock reads back as `wanted`, at
    /// most twice.
    fn attempt_twice<F>(&self, wanted: LockState, mut operation: F) -> Result<(), ErrorFor<Self>>
    where
        F: FnMut(&Self) -> Result<(), ErrorFor<Self>>,
    {
        for attempt in 1..=ATTEMPTS {
            Self::tolerate(operation(self))?;

            if self.password_lock_state()? == wanted {
                info!("SD reached {:?} after {} attempts", wanted, attempt);
                return Ok(());
            }

            warn!("SD still not {:?}, attempt: {}", wanted, attempt);
        }

        Err(Error::NotConfirmed)
    }

    /// Initialize and read every register.
    pub fn examine(&mut self) -> Result<CardInfo, ErrorFor<Self>> {
        let card_type = self.initialize()?;

        let ocr = match self.read_ocr() {
            Ok(ocr) => Some(ocr),
            Err(error) if error.kind() == ErrorKind::Bus => return Err(error),
            Err(_) => {
                warn!("SD rejected READ_OCR");
                None
            }
        };

        Ok(CardInfo {
            card_type,
            ocr,
            csd: self.read_csd()?,
            cid: self.read_cid()?,
            status: self.read_card_status()?,
        })
    }

    /// Set or clear the temporary write protection and confirm it on the
    /// card.
    pub fn temporary_lock(&mut self, locked: bool) -> Result<(), ErrorFor<Self>> {
        self.initialize()?;
        self.set_temporary_lock(locked)?;

        if self.temporary_lock_bit()?.is_locked() == locked {
            info!("SD temporary lock confirmed: {}", locked);
            Ok(())
        } else {
            warn!("SD ignored the CSD update");
            Err(Error::NotConfirmed)
        }
    }

    /// Temporary write protection as currently stored in the CSD.
    pub fn temporary_lock_state(&mut self) -> Result<LockState, ErrorFor<Self>> {
        self.initialize()?;
        self.temporary_lock_bit()
    }

    /// Password lock as reported by the card status.
    pub fn password_state(&mut self) -> Result<LockState, ErrorFor<Self>> {
        self.initialize()?;
        self.password_lock_state()
    }

    /// Protect the card with the built-in password and lock it.
    pub fn password_lock(&mut self) -> Result<(), ErrorFor<Self>> {
        self.initialize()?;

        if self.password_lock_state()?.is_locked() {
            info!("SD already locked");
            return Ok(());
        }

        self.load_default_password();
        Self::tolerate(self.modify_password(lock_mask::SET_PASSWORD))?;

        self.attempt_twice(LockState::Locked, |sd| {
            sd.modify_password(lock_mask::LOCK_UNLOCK)
        })
    }

    /// Clear the built-in password, which unlocks the card.
    pub fn password_unlock(&mut self) -> Result<(), ErrorFor<Self>> {
        self.initialize()?;

        if !self.password_lock_state()?.is_locked() {
            info!("SD already unlocked");
            return Ok(());
        }

        self.load_default_password();
        self.attempt_twice(LockState::Unlocked, |sd| {
            sd.modify_password(lock_mask::CLEAR_PASSWORD)
        })
    }

    /// Force erase a card locked with an unknown password.
    pub fn erase_locked_card(&mut self) -> Result<(), ErrorFor<Self>> {
        self.initialize()?;

        if !self.password_lock_state()?.is_locked() {
            info!("SD not locked, nothing to erase");
            return Ok(());
        }

        self.attempt_twice(LockState::Unlocked, |sd| {
            let result = sd.force_erase();
            Self::delay(Config::ERASE_SETTLE_CYCLES);
            result
        })
    }

    /// Read block 0.
    pub fn read_first_block(&mut self, buf: &mut Block) -> Result<(), ErrorFor<Self>> {
        self.initialize()?;
        self.read_block(0, buf)
    }
}
