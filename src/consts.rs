/// Size of a data block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of a data block in bytes, as `u64`.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_OP_COND - legacy initialization of standard capacity cards.
    pub const CMD1: u8 = CMD_BASE + 1;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// SEND_CID - read the Card Identification (CID register).
    pub const CMD10: u8 = CMD_BASE + 10;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = CMD_BASE + 13;
    /// SET_BLOCKLEN - set the block length in bytes.
    pub const CMD16: u8 = CMD_BASE + 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// PROGRAM_CSD - program the programmable bits of the CSD.
    pub const CMD27: u8 = CMD_BASE + 27;
    /// LOCK_UNLOCK - set/reset the password or lock/unlock the card.
    pub const CMD42: u8 = CMD_BASE + 42;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// Commands followed by a data phase keep the card selected.
    pub const fn has_data_phase(cmd: u8) -> bool {
        matches!(
            cmd,
            CMD8 | CMD9 | CMD10 | CMD13 | CMD17 | CMD27 | CMD42 | CMD58
        )
    }
}

pub mod arguments {
    /// SEND_IF_COND argument: 2.7-3.6V and check pattern 0xAA.
    pub const IF_COND: u32 = 0x0000_01AA;
    /// ACMD41 argument: host supports high capacity cards.
    pub const HIGH_CAPACITY_SUPPORT: u32 = 1 << 30;
}

pub mod frame_crc {
    /// CRC byte of `CMD0(0)`.
    pub const GO_IDLE: u8 = 0x95;
    /// CRC byte of `CMD8(0x1AA)`.
    pub const SEND_IF_COND: u8 = 0x87;
    /// Any other command: CRC is not checked in SPI mode, stop bit only.
    pub const PLACEHOLDER: u8 = 0x01;
}

pub mod tokens {
    /// Line idle, nothing sent by the card.
    pub const IDLE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Error tokens have these bits cleared.
    pub const DATA_ERROR_MASK: u8 = 0xE0;
    /// Card holds the line low while busy.
    pub const BUSY: u8 = 0x00;
    /// Filler for unused CMD42 payload bytes.
    pub const FILLER: u8 = 0xFF;
}

/// CMD42 mode bits, first byte of the lock/unlock payload.
pub mod lock_mask {
    /// Set a new password.
    pub const SET_PASSWORD: u8 = 0x01;
    /// Clear the password.
    pub const CLEAR_PASSWORD: u8 = 0x02;
    /// Lock the card (unlock when cleared).
    pub const LOCK_UNLOCK: u8 = 0x04;
    /// Forced erase of a locked card.
    pub const ERASE: u8 = 0x08;
    /// Bits accepted by password modification.
    pub const PASSWORD_BITS: u8 = SET_PASSWORD | CLEAR_PASSWORD | LOCK_UNLOCK;
}
