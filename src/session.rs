use crate::{csd::CsdData, response::CardStatus, response::R3OcrPayload, CardType};

/// Operating Conditions Register.
pub type Ocr = R3OcrPayload;
/// Card Identification register.
pub type Cid = [u8; 16];

/// What the driver currently knows about the card.
///
/// A register slot is `Some` only while the last read of it succeeded and no
/// operation failed since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardSession {
    pub card_type: CardType,
    pub ocr: Option<Ocr>,
    pub csd: Option<CsdData>,
    pub cid: Option<Cid>,
    pub status: Option<CardStatus>,
}

impl CardSession {
    /// Forget everything, including the card type.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Drop all register contents, keep the card type.
    pub fn invalidate(&mut self) {
        *self = CardSession {
            card_type: self.card_type,
            ..Self::default()
        };
    }
}
