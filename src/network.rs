// PostgreSQL wire protocol network module

pub mod message;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use message::{ColumnDescriptor, RequestMessage, ResponseMessage, TransactionStatus};
pub use protocol::{ProtocolHandler, SessionPhase, SessionState};
pub use server::{Server, ServerConfig};
pub use session::{SessionConfig, SessionHandler};

use crate::channel::ChannelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Invalid column name {0:?}")]
    InvalidColumnName(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

// PostgreSQL protocol version
pub const PROTOCOL_VERSION_3: i32 = 0x0003_0000; // 3.0

// Request codes sent in place of a protocol version
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const SSL_REQUEST_CODE: i32 = 0x04D2_162F; // 80877103
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

// Initial capacity of each connection's read buffer
pub const READ_BUFFER_CAPACITY: usize = 64 * 1024;

// Upper bound for untagged startup-phase messages, as enforced by PostgreSQL
pub const MAX_STARTUP_MESSAGE_LEN: usize = 10_000;
