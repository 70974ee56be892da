// USB CDC endpoints as packet links for the serial port

use embassy_usb::class::cdc_acm::{Receiver, Sender};
use embassy_usb::driver::{Driver, EndpointError};
use i2c_bridge_protocol::{LinkError, PacketRx, PacketTx};

pub struct BulkOut<'d, D: Driver<'d>>(pub Receiver<'d, D>);

pub struct BulkIn<'d, D: Driver<'d>>(pub Sender<'d, D>);

fn link_error(e: EndpointError) -> LinkError {
    match e {
        EndpointError::BufferOverflow => LinkError::Overflow,
        EndpointError::Disabled => LinkError::Disconnected,
    }
}

impl<'d, D: Driver<'d>> PacketRx for BulkOut<'d, D> {
    async fn read_packet(&mut self, buffer: &mut [u8]) -> Result<usize, LinkError> {
        self.0.read_packet(buffer).await.map_err(link_error)
    }
}

impl<'d, D: Driver<'d>> PacketTx for BulkIn<'d, D> {
    async fn write_packet(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.0.write_packet(data).await.map_err(link_error)
    }
}
