//! TIMINGR values for STM32 "v2" I2C peripherals, derived from the kernel
//! clock instead of looked up from a vendor table.

use core::fmt;

const PICOS_PER_SECOND: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSpeed {
    /// 100 kHz
    Standard,
    /// 400 kHz
    Fast,
}

impl BusSpeed {
    pub const fn hz(self) -> u32 {
        match self {
            BusSpeed::Standard => 100_000,
            BusSpeed::Fast => 400_000,
        }
    }

    /// Minimum SCL low / high times from the I2C specification, in ns.
    const fn min_low_high_ns(self) -> (u32, u32) {
        match self {
            BusSpeed::Standard => (4_700, 4_000),
            BusSpeed::Fast => (1_300, 600),
        }
    }

    /// Data setup / hold targets, in ns.
    const fn setup_hold_ns(self) -> (u32, u32) {
        match self {
            BusSpeed::Standard => (1_250, 500),
            BusSpeed::Fast => (375, 375),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimingError {
    /// Fewer than four kernel cycles per SCL period
    KernelClockTooSlow,
    /// Even the largest prescaler cannot fit SCLL/SCLH into 8 bits
    KernelClockTooFast,
}

impl fmt::Display for TimingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingError::KernelClockTooSlow => write!(f, "I2C kernel clock too slow for bus speed"),
            TimingError::KernelClockTooFast => write!(f, "I2C kernel clock too fast for prescaler"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TimingError {}

/// Field values of the TIMINGR register (each stored as register value,
/// i.e. one less than the tick count where the hardware adds one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub presc: u8,
    pub scldel: u8,
    pub sdadel: u8,
    pub sclh: u8,
    pub scll: u8,
}

impl Timing {
    pub fn new(kernel_hz: u32, speed: BusSpeed) -> Result<Self, TimingError> {
        let cycles = kernel_hz.div_ceil(speed.hz());
        if cycles < 4 {
            return Err(TimingError::KernelClockTooSlow);
        }

        let (min_low, min_high) = speed.min_low_high_ns();
        let (setup_ns, hold_ns) = speed.setup_hold_ns();

        for presc in 0..16u32 {
            let ticks = cycles.div_ceil(presc + 1);
            let low = ticks * min_low / (min_low + min_high);
            let high = ticks - low;

            if low == 0 || high == 0 || low > 256 || high > 256 {
                continue;
            }

            let tick_ps = (presc as u64 + 1) * PICOS_PER_SECOND / kernel_hz as u64;
            let setup = (setup_ns as u64 * 1_000).div_ceil(tick_ps).clamp(1, 16);
            let hold = (hold_ns as u64 * 1_000).div_ceil(tick_ps).min(15);

            return Ok(Self {
                presc: presc as u8,
                scldel: (setup - 1) as u8,
                sdadel: hold as u8,
                sclh: (high - 1) as u8,
                scll: (low - 1) as u8,
            });
        }

        Err(TimingError::KernelClockTooFast)
    }

    /// Raw TIMINGR word.
    pub const fn bits(&self) -> u32 {
        ((self.presc as u32 & 0xf) << 28)
            | ((self.scldel as u32 & 0xf) << 20)
            | ((self.sdadel as u32 & 0xf) << 16)
            | ((self.sclh as u32) << 8)
            | self.scll as u32
    }

    /// Nominal SCL frequency, ignoring synchronisation and rise/fall times.
    pub fn scl_hz(&self, kernel_hz: u32) -> u32 {
        let ticks = (self.scll as u32 + 1) + (self.sclh as u32 + 1);
        kernel_hz / ((self.presc as u32 + 1) * ticks)
    }
}
