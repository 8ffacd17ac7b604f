//! Bit-granularity serialization primitives shared by the garnet wire
//! protocol. Every framed structure the transport produces or consumes goes
//! through [`BitWriter`] and [`BitReader`].

mod bitstream;
mod error;

pub use bitstream::{BitReader, BitWriter};
pub use error::{BinaryError, Result};
