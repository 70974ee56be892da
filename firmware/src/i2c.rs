//! I2C1 master on PA15 (SCL) / PB7 (SDA), driven at register level with
//! DMA1 channel 1 (TX) and channel 2 (RX).
//!
//! Completion is reported only by the I2C event/error interrupts: TC after
//! the last byte of a chunk, NACK, or a bus error. Each handler masks both
//! I2C lines in the NVIC and gives [`BUS_DONE`]; the engine unmasks them
//! again once the chunk has settled. The DMA channels run without
//! interrupts and are checked when a chunk is torn down.

use embassy_stm32::interrupt;
use embassy_stm32::interrupt::InterruptExt;
use embassy_stm32::pac;
use embassy_stm32::pac::bdma::vals as dma_vals;
use embassy_stm32::pac::gpio::vals as gpio_vals;
use embassy_stm32::pac::i2c::vals as i2c_vals;
use embassy_stm32::peripherals;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use i2c_bridge_protocol::{BusDriver, BusSpeed, Direction, DmaOutcome, Timing, TimingError};

/// Given from interrupt context when the current chunk needs attention.
pub static BUS_DONE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

const TX_CHANNEL: usize = 0;
const RX_CHANNEL: usize = 1;

// DMAMUX request lines (RM0440, table 91)
const DMAREQ_I2C1_RX: u8 = 16;
const DMAREQ_I2C1_TX: u8 = 17;

const SCL_PIN: usize = 15;
const SDA_PIN: usize = 7;
const I2C_AF: u8 = 4;

/// PE must stay low for at least three APB cycles on a software reset.
const SOFT_RESET_SPINS: u32 = 32;

/// The last RX byte can still be in flight when TC fires.
const DMA_SETTLE_SPINS: u32 = 64;

pub struct Stm32Bus {
    regs: pac::i2c::I2c,
    dma: pac::bdma::Dma,
}

impl Stm32Bus {
    /// Take over I2C1, its pins and its DMA channels.
    ///
    /// `kernel_hz` is the I2C1 kernel clock (PCLK1 unless CCIPR says
    /// otherwise).
    pub fn new(
        _i2c: peripherals::I2C1,
        _scl: peripherals::PA15,
        _sda: peripherals::PB7,
        _tx_dma: peripherals::DMA1_CH1,
        _rx_dma: peripherals::DMA1_CH2,
        kernel_hz: u32,
    ) -> Result<Self, TimingError> {
        let timing = Timing::new(kernel_hz, BusSpeed::Fast)?;
        defmt::info!(
            "i2c: TIMINGR 0x{:08x} ({} Hz)",
            timing.bits(),
            timing.scl_hz(kernel_hz)
        );

        let bus = Self {
            regs: pac::I2C1,
            dma: pac::DMA1,
        };

        pac::RCC.ahb1enr().modify(|w| {
            w.set_dma1en(true);
            w.set_dmamux1en(true);
        });
        pac::RCC.apb1enr1().modify(|w| w.set_i2c1en(true));
        pac::RCC.apb1rstr1().modify(|w| w.set_i2c1rst(true));
        pac::RCC.apb1rstr1().modify(|w| w.set_i2c1rst(false));

        configure_pin(pac::GPIOA, SCL_PIN);
        configure_pin(pac::GPIOB, SDA_PIN);

        pac::DMAMUX1
            .ccr(TX_CHANNEL)
            .write(|w| w.set_dmareq_id(DMAREQ_I2C1_TX));
        pac::DMAMUX1
            .ccr(RX_CHANNEL)
            .write(|w| w.set_dmareq_id(DMAREQ_I2C1_RX));

        bus.regs.cr1().modify(|w| w.set_pe(false));
        bus.regs
            .timingr()
            .write_value(pac::i2c::regs::Timingr(timing.bits()));
        bus.regs.cr1().modify(|w| {
            w.set_txdmaen(true);
            w.set_rxdmaen(true);
            w.set_nackie(true);
            w.set_errie(true);
            w.set_pe(true);
        });

        for irq in [interrupt::I2C1_EV, interrupt::I2C1_ER] {
            irq.unpend();
            // SAFETY: the handlers below only touch registers and BUS_DONE.
            unsafe { irq.enable() };
        }

        Ok(bus)
    }

    fn channel(&self, direction: Direction) -> pac::bdma::Ch {
        match direction {
            Direction::Write => self.dma.ch(TX_CHANNEL),
            Direction::Read => self.dma.ch(RX_CHANNEL),
        }
    }

    fn channel_index(direction: Direction) -> usize {
        match direction {
            Direction::Write => TX_CHANNEL,
            Direction::Read => RX_CHANNEL,
        }
    }
}

fn configure_pin(port: pac::gpio::Gpio, pin: usize) {
    port.otyper().modify(|w| w.set_ot(pin, gpio_vals::Ot::OPENDRAIN));
    port.ospeedr()
        .modify(|w| w.set_ospeedr(pin, gpio_vals::Ospeedr::HIGHSPEED));
    port.pupdr().modify(|w| w.set_pupdr(pin, gpio_vals::Pupdr::PULLUP));
    port.afr(pin / 8).modify(|w| w.set_afr(pin % 8, I2C_AF));
    port.moder()
        .modify(|w| w.set_moder(pin, gpio_vals::Moder::ALTERNATE));
}

impl BusDriver for Stm32Bus {
    fn configure(&mut self, address: u8, direction: Direction, length: u8) {
        // AUTOEND and RELOAD stay clear: STOP is always issued by software.
        self.regs.cr2().write(|w| {
            w.set_sadd((address as u16) << 1);
            w.set_dir(match direction {
                Direction::Read => i2c_vals::Dir::READ,
                Direction::Write => i2c_vals::Dir::WRITE,
            });
            w.set_nbytes(length);
        });
    }

    unsafe fn arm_dma(&mut self, direction: Direction, buffer: *mut u8, length: u8) {
        let ch = self.channel(direction);
        let index = Self::channel_index(direction);

        ch.cr().write(|w| w.set_en(false));
        self.dma.ifcr().write(|w| w.set_gif(index, true));

        let peripheral = match direction {
            Direction::Write => self.regs.txdr().as_ptr() as u32,
            Direction::Read => self.regs.rxdr().as_ptr() as u32,
        };
        ch.par().write_value(peripheral);
        ch.mar().write_value(buffer as u32);
        ch.ndtr().write(|w| w.set_ndt(length as u16));
        ch.cr().write(|w| {
            w.set_dir(match direction {
                Direction::Write => dma_vals::Dir::FROM_MEMORY,
                Direction::Read => dma_vals::Dir::FROM_PERIPHERAL,
            });
            w.set_minc(true);
            w.set_pinc(false);
            w.set_msize(dma_vals::Size::BITS8);
            w.set_psize(dma_vals::Size::BITS8);
            w.set_en(true);
        });
    }

    fn disarm_dma(&mut self, direction: Direction) -> DmaOutcome {
        let index = Self::channel_index(direction);

        let mut isr = self.dma.isr().read();
        for _ in 0..DMA_SETTLE_SPINS {
            if isr.tcif(index) || isr.teif(index) {
                break;
            }
            isr = self.dma.isr().read();
        }

        self.channel(direction).cr().modify(|w| w.set_en(false));
        self.dma.ifcr().write(|w| w.set_gif(index, true));

        DmaOutcome {
            complete: isr.tcif(index),
            error: isr.teif(index),
        }
    }

    fn send_start(&mut self) {
        self.regs.cr2().modify(|w| w.set_start(true));
        // TC of the previous chunk is cleared by START; only now can it
        // be used as this chunk's completion.
        self.regs.cr1().modify(|w| w.set_tcie(true));
    }

    fn send_stop(&mut self) {
        self.regs.cr2().modify(|w| w.set_stop(true));
    }

    fn transfer_complete(&self) -> bool {
        self.regs.isr().read().tc()
    }

    fn nack_received(&self) -> bool {
        self.regs.isr().read().nackf()
    }

    fn clear_nack(&mut self) {
        self.regs.icr().write(|w| {
            w.set_nackcf(true);
            w.set_stopcf(true);
        });
    }

    fn soft_reset(&mut self) {
        self.regs.cr1().modify(|w| w.set_pe(false));
        for _ in 0..SOFT_RESET_SPINS {
            if !self.regs.cr1().read().pe() {
                break;
            }
        }
        cortex_m::asm::delay(SOFT_RESET_SPINS);
        self.regs.cr1().modify(|w| w.set_pe(true));
    }

    fn rearm_interrupts(&mut self) {
        // TC stays set while the bus is held for a repeated START.
        self.regs.cr1().modify(|w| w.set_tcie(false));

        for irq in [interrupt::I2C1_EV, interrupt::I2C1_ER] {
            irq.unpend();
            // SAFETY: see `Stm32Bus::new`.
            unsafe { irq.enable() };
        }
    }
}

fn on_bus_event() {
    let regs = pac::I2C1;
    let isr = regs.isr().read();

    // Spurious BERR (errata 2.8.1): clear and carry on.
    if isr.berr() {
        regs.icr().write(|w| w.set_berrcf(true));
    }

    if isr.tc() || isr.nackf() || isr.arlo() || isr.ovr() {
        interrupt::I2C1_EV.disable();
        interrupt::I2C1_ER.disable();
        BUS_DONE.signal(());
    }
}

#[interrupt]
fn I2C1_EV() {
    on_bus_event();
}

#[interrupt]
fn I2C1_ER() {
    on_bus_event();
}
