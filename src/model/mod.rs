pub mod bar;
pub mod command;
pub mod event;
pub mod message;
pub mod request;
pub mod study;

pub use bar::OhlcvBar;
pub use event::ServerEvent;
pub use message::{Handshake, Message, Packet};
pub use request::{ChartData, ChartRequest, Credentials, SymbolMetadata};
pub use study::{IndicatorPoint, IndicatorSeries, StudyConfig};
