use crate::{
    consts::{commands, lock_mask, tokens, BLOCK_SIZE},
    ErrorFor, R1Response, SdLocker, SdLockerConfig,
};

use core::fmt;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "log")]
use log::{info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{info, warn};

/// Longest password a card accepts.
pub const MAX_PASSWORD_LEN: usize = 16;

/// Built-in credential used by the lock and unlock actions.
pub const DEFAULT_PASSWORD: &[u8; MAX_PASSWORD_LEN] = b"Fourth Amendment";

/// Password buffer sent with CMD42.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Password {
    bytes: [u8; MAX_PASSWORD_LEN],
    len: u8,
}

impl Password {
    /// No password.
    pub const fn empty() -> Self {
        Password {
            bytes: [0; MAX_PASSWORD_LEN],
            len: 0,
        }
    }

    /// `None` when `password` is longer than [`MAX_PASSWORD_LEN`].
    pub fn new(password: &[u8]) -> Option<Self> {
        if password.len() > MAX_PASSWORD_LEN {
            return None;
        }

        let mut bytes = [0; MAX_PASSWORD_LEN];
        bytes[..password.len()].copy_from_slice(password);

        Some(Password {
            bytes,
            len: password.len() as u8,
        })
    }

    /// The built-in credential.
    pub const fn default_credential() -> Self {
        Password {
            bytes: *DEFAULT_PASSWORD,
            len: MAX_PASSWORD_LEN as u8,
        }
    }

    /// Password bytes, without filler.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Password length in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// `true` for the empty password.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password").field("len", &self.len).finish()
    }
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdLockerConfig> SdLocker<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Use the built-in credential for the next password operation.
    pub fn load_default_password(&mut self) {
        self.password = Password::default_credential();
    }

    /// Use `password` for the next password operation.
    pub fn set_password(&mut self, password: Password) {
        self.password = password;
    }

    /// Send a LOCK_UNLOCK data block with the current password.
    ///
    /// Only the set, clear and lock bits of `mask` are kept. The payload is
    /// one full block: mask, length, password, filler.
    pub fn modify_password(&self, mask: u8) -> Result<(), ErrorFor<Self>> {
        let mask = mask & lock_mask::PASSWORD_BITS;
        info!("SD password operation, mask: 0x{:02X}", mask);

        let result = self.send_password_block(mask);

        self.session.borrow_mut().status = None;
        self.tracked(result)
    }

    fn send_password_block(&self, mask: u8) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD42, 0x0000_0000)?;
        self.expect_r1(commands::CMD42, r1, R1Response::READY_STATE)?;

        let password = self.password.as_bytes();

        self.send(tokens::DATA_START_BLOCK)?;
        self.send(mask)?;
        self.send(password.len() as u8)?;
        self.send_slice(password)?;

        for _ in password.len() + 2..BLOCK_SIZE {
            self.send(tokens::FILLER)?;
        }

        self.clock()?;
        self.clock()?;

        self.wait_not_busy()
    }

    /// Erase a locked card, dropping its password and all of its data.
    ///
    /// Only the erase mask is sent; the card needs time to complete the
    /// erase afterwards.
    pub fn force_erase(&self) -> Result<(), ErrorFor<Self>> {
        warn!("SD forced erase");

        let result = self.send_erase_block();

        self.session.borrow_mut().invalidate();
        result
    }

    fn send_erase_block(&self) -> Result<(), ErrorFor<Self>> {
        self.send_command(commands::CMD16, 1)?;

        let r1 = self.send_command(commands::CMD42, 0x0000_0000)?;
        self.expect_r1(commands::CMD42, r1, R1Response::READY_STATE)?;

        self.send(tokens::DATA_START_BLOCK)?;
        self.send(lock_mask::ERASE)
    }
}
