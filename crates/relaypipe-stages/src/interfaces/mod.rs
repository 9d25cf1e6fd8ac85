//! Interfaces: the stages at the bottom of a chain that move bytes in and
//! out of the process.

mod file;
mod loopback;
mod serial;
mod udp;

pub use file::{FileInputInterface, FileOutputInterface, FILE_READ_BLOCK};
pub use loopback::{DropFilter, LoopbackInterface};
pub use serial::{SerialInterface, DEFAULT_BAUD};
pub use udp::{UdpTransceiver, MAX_DATAGRAM};
