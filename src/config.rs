/// Represents config for [`SdLocker`](crate::SdLocker).
///
/// Every poll in the driver is an attempt budget, so timing only depends on
/// the SPI clock and these numbers.
pub trait SdLockerConfig {
    /// Dummy bytes clocked with the card deselected at power up.
    const POWER_UP_CLOCKS: usize;
    /// Max attempts of GO_IDLE_STATE before the card is considered missing.
    const GO_IDLE_ATTEMPTS: usize;
    /// Max attempts to read R1.
    const READ_R1_ATTEMPTS: usize;
    /// Max initialization polls (ACMD41 or CMD1).
    const INIT_ATTEMPTS: usize;
    /// Max attempts to read a data token.
    const TOKEN_ATTEMPTS: usize;
    /// Max polls while the card is busy programming.
    const BUSY_ATTEMPTS: usize;
    /// Count of dummy cycles to let the card finish a forced erase.
    const ERASE_SETTLE_CYCLES: usize;
    /// Check the trailing CRC16 of register and block reads.
    const VERIFY_DATA_CRC: bool;
}

/// Default implementation of [`SdLockerConfig`](crate::SdLockerConfig).
pub struct DefaultSdLockerConfig;

impl SdLockerConfig for DefaultSdLockerConfig {
    const POWER_UP_CLOCKS: usize = 10;
    const GO_IDLE_ATTEMPTS: usize = 16;
    const READ_R1_ATTEMPTS: usize = 10;
    const INIT_ATTEMPTS: usize = 20_000;
    const TOKEN_ATTEMPTS: usize = 100;
    const BUSY_ATTEMPTS: usize = 65_535;
    const ERASE_SETTLE_CYCLES: usize = 1_000_000;
    const VERIFY_DATA_CRC: bool = false;
}
