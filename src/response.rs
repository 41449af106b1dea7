use bitfield::bitfield;
use core::fmt;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    /// Start bit still high: the card did not answer.
    pub no_response, _: 7;
}

impl R1Response {
    /// Card initialized, no error.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card in idle state, no error.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);

    /// Raw response byte.
    pub fn raw(&self) -> u8 {
        self.0
    }

    /// A response arrived (start bit cleared).
    pub fn is_valid(&self) -> bool {
        !self.no_response()
    }
}

impl From<u8> for R1Response {
    fn from(byte: u8) -> Self {
        R1Response(byte)
    }
}

bitfield! {
    /// R2 card status: R1 in the high byte, status byte in the low byte.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CardStatus(u16);
    impl Debug;
    pub card_is_locked, _: 0;
    pub lock_unlock_failed, _: 1;
    pub error, _: 2;
    pub cc_error, _: 3;
    pub card_ecc_failed, _: 4;
    pub write_protect_violation, _: 5;
    pub erase_param, _: 6;
    pub out_of_range, _: 7;
    pub in_idle_state, _: 8;
    pub erase_reset, _: 9;
    pub illegal_command, _: 10;
    pub command_crc_error, _: 11;
    pub erase_sequence_error, _: 12;
    pub address_error, _: 13;
    pub parameter_error, _: 14;
}

impl CardStatus {
    /// Build from the two bytes as received.
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        CardStatus(u16::from_be_bytes(bytes))
    }

    /// The two bytes as received.
    pub fn bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Card is password-locked.
    pub fn is_locked(&self) -> bool {
        self.card_is_locked()
    }
}

bitfield! {
    /// Data error token, sent instead of a start token when a read fails.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DataErrorToken(u8);
    impl Debug;
    pub error, _: 0;
    pub cc_error, _: 1;
    pub card_ecc_failed, _: 2;
    pub out_of_range, _: 3;
    pub card_locked, _: 4;
}

impl DataErrorToken {
    /// Interpret a token, `None` when it is not an error token.
    pub fn decode(token: u8) -> Option<Self> {
        if token & crate::consts::tokens::DATA_ERROR_MASK == 0 {
            Some(DataErrorToken(token))
        } else {
            None
        }
    }

    /// Raw token byte.
    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for DataErrorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.card_locked(), "card is locked"),
            (self.out_of_range(), "address is out of range"),
            (self.card_ecc_failed(), "card ECC failed"),
            (self.cc_error(), "card CC failed"),
            (self.error(), "general error"),
        ];

        let mut first = true;
        for (_, text) in flags.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(text)?;
            first = false;
        }

        if first {
            f.write_str("unspecified data error")?;
        }

        Ok(())
    }
}

/// R3 OCR payload.
pub type R3OcrPayload = [u8; 4];
