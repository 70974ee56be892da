#![no_std]
#![no_main]

use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::join::join3;
use embassy_stm32::usb::Driver;
use embassy_stm32::{bind_interrupts, peripherals, usb};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Delay;
use embassy_usb::class::cdc_acm::{CdcAcmClass, State};
use embassy_usb::Builder;
use i2c_bridge_protocol::{I2cEngine, SerialPort, Shell, PACKET_SIZE, STREAM_CAPACITY};
use panic_probe as _;
use static_cell::StaticCell;

mod i2c;
mod usb_cdc;

use i2c::{Stm32Bus, BUS_DONE};
use usb_cdc::{BulkIn, BulkOut};

bind_interrupts!(struct Irqs {
    USB_LP => usb::InterruptHandler<peripherals::USB>;
});

/// SYSCLK, and PCLK1 which clocks I2C1
const SYSCLK_HZ: u32 = 170_000_000;

static PORT: SerialPort<CriticalSectionRawMutex, STREAM_CAPACITY> = SerialPort::new();

static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();
static USB_STATE: StaticCell<State> = StaticCell::new();

fn configure_stm32() -> embassy_stm32::Config {
    let mut config = embassy_stm32::Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hsi48 = Some(Hsi48Config {
            sync_from_usb: true,
        });
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: None,
            // Main system clock at 170 MHz
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;
        config.rcc.mux.clk48sel = mux::Clk48sel::HSI48;
        config.enable_ucpd1_dead_battery = true;
    }
    config
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_stm32::init(configure_stm32());
    defmt::info!("STM32 initialized");

    let bus = defmt::unwrap!(Stm32Bus::new(
        p.I2C1, p.PA15, p.PB7, p.DMA1_CH1, p.DMA1_CH2, SYSCLK_HZ
    ));
    defmt::info!("I2C1 ready on PA15(SCL), PB7(SDA)");

    let driver = Driver::new(p.USB, Irqs, p.PA12, p.PA11);

    let mut usb_config = embassy_usb::Config::new(0x0483, 0x5740);
    usb_config.manufacturer = Some("STM32G4 I2C Bridge");
    usb_config.product = Some("USB-I2C Bridge");
    usb_config.serial_number = Some("00000001");
    usb_config.max_power = 100;
    usb_config.max_packet_size_0 = 64;

    // Required for Windows compatibility
    usb_config.device_class = 0xEF;
    usb_config.device_sub_class = 0x02;
    usb_config.device_protocol = 0x01;
    usb_config.composite_with_iads = true;

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [], // no msos descriptors
        CONTROL_BUF.init([0; 64]),
    );

    let class = CdcAcmClass::new(
        &mut builder,
        USB_STATE.init(State::new()),
        PACKET_SIZE as u16,
    );
    let mut usb_device = builder.build();

    let (sender, receiver) = class.split();
    let mut bulk_in = BulkIn(sender);
    let mut bulk_out = BulkOut(receiver);

    defmt::info!("System ready");

    let usb_fut = usb_device.run();

    let serial_fut = async {
        loop {
            bulk_out.0.wait_connection().await;
            defmt::info!("USB connected");
            PORT.link_up();
            let e = PORT.service(&mut bulk_out, &mut bulk_in).await;
            defmt::info!("USB disconnected: {}", e);
        }
    };

    let shell_fut = async {
        let engine = I2cEngine::new(bus, &BUS_DONE, Delay);
        Shell::new(&PORT, engine).run().await
    };

    join3(usb_fut, serial_fut, shell_fut).await;
}
