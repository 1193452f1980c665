//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockTransport, TransferRecord};
pub use nusb::NusbTransport;
pub use traits::{DfuTransport, Direction, TransportError};
