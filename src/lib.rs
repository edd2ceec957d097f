//! Host side of the Nysa FPGA platform.
//!
//! The FPGA sits behind an FT2232H bridge running in synchronous FIFO mode.
//! The `Link` streams command and response frames over the bridge's bulk
//! endpoints through any `Transport`. `UsbBus` turns those frames into
//! register and memory access, the `Bus` interface the drivers and the `Dma`
//! engine are written against.
//!
//! The `ftdi` feature adds `FtdiTransport`, the hardware backend.

#[macro_use]
extern crate log;

#[macro_use]
extern crate static_assertions;

pub mod frame;
pub mod modem;
pub mod transport;
pub mod pool;
pub mod reassembly;
pub mod session;
pub mod link;
pub mod bus;
pub mod drt;
pub mod driver;
pub mod dma;
pub mod error;

#[cfg(feature = "ftdi")]
pub mod ftdi;

#[cfg(test)]
mod mock;

pub use frame::*;
pub use modem::*;
pub use transport::*;
pub use pool::*;
pub use reassembly::*;
pub use session::*;
pub use link::*;
pub use bus::*;
pub use drt::*;
pub use driver::*;
pub use dma::*;
pub use error::*;

#[cfg(feature = "ftdi")]
pub use ftdi::*;

/// Direction of a bulk transfer, seen from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Out,
    In,
}
