pub mod engine;
pub mod error;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod ticker;
pub mod transfer;


pub use error::{Error, Result};
pub use integrity::{ContentHasher, Verdict};
pub use protocol::Handshake;
pub use session::{SessionConfig, SessionReport, SessionState, TransferSession};
pub use ticker::{ThroughputReport, Ticker, TransferCounters};
pub use transfer::{run_sender, SendOptions, SendProgress, SendReport};
