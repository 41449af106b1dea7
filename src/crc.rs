/// CRC7 polynomial (x^7 + x^3 + 1) aligned to the top of a byte.
const CRC7_POLY: u8 = 0x89;

/// CRC-7 lookup table.
pub struct Crc7Table([u8; 256]);

/// Table shared by every CRC7 user.
pub static CRC7_TABLE: Crc7Table = Crc7Table::build();

impl Crc7Table {
    /// Generate the table for all 256 byte values.
    pub const fn build() -> Self {
        let mut table = [0u8; 256];
        let mut i = 0;

        while i < 256 {
            let mut value = i as u8;
            if value & 0x80 != 0 {
                value ^= CRC7_POLY;
            }

            let mut bit = 1;
            while bit < 8 {
                value <<= 1;
                if value & 0x80 != 0 {
                    value ^= CRC7_POLY;
                }
                bit += 1;
            }

            table[i] = value;
            i += 1;
        }

        Crc7Table(table)
    }

    /// Add one byte to a running CRC-7.
    pub fn extend(&self, crc: u8, byte: u8) -> u8 {
        self.0[usize::from((crc << 1) ^ byte)]
    }

    /// CRC-7 of a slice, seeded at 0.
    pub fn checksum(&self, data: &[u8]) -> u8 {
        data.iter().fold(0, |crc, &byte| self.extend(crc, byte))
    }
}

/// CRC-16 calculation.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}
