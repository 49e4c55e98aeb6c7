pub mod connection;
pub mod frame;

pub use connection::{Connection, TransportEvent};
pub use frame::{decode, encode, DecodedFrame};
