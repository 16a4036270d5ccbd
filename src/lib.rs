//! Desktop side of the ESP32 telemetry link: command encoding, line
//! classification, block flow control and the session worker that ties them
//! to a BLE transport.

pub mod acks;
pub mod bridge;
pub mod config;
pub mod console;
pub mod flow;
pub mod model;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;

pub use bridge::EventReceiver;
pub use config::Config;
pub use model::{Event, SessionStatus, Status, StatusKind};
pub use protocol::{Command, CommandKind};
pub use session::{spawn_session, SessionConfig, SessionHandle};
pub use sink::{CsvSink, TelemetrySink};
pub use transport::{Transport, TransportError};
