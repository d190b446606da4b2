pub mod client;
pub mod error;
pub mod protocol;

pub use client::{
    ListenClient, ListenOptions, CONNECT_TIMEOUT, RETRY_AFTER_DROP, RETRY_AFTER_FAILED_CONNECT,
    RETRY_AFTER_WATCHDOG_CONNECT,
};
pub use error::ListenError;
pub use protocol::{Inbound, Outbound, SessionTarget, StatusEnvelope, StatusPayload, TimeReply};
