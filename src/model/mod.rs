use serde::Serialize;
use std::fmt;

/// Block identifier carried by `WAIT_ACK:<id>` and echoed in `ACK:BLOCK_<id>`.
///
/// Kept as the text the device sent so the acknowledgment matches it byte
/// for byte (`007` stays `007`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Reserved id acknowledging the end of a transfer rather than a block.
    pub const SENTINEL: &'static str = "9999";

    pub fn new(id: impl Into<String>) -> Self {
        BlockId(id.into())
    }

    pub fn sentinel() -> Self {
        BlockId::new(Self::SENTINEL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckKind {
    Sync,
    Set,
    Fetch,
    Reset,
    GetMem,
    Other(String),
}

impl AckKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "SYNC" => AckKind::Sync,
            "SET" => AckKind::Set,
            "FETCH" => AckKind::Fetch,
            "RESET" => AckKind::Reset,
            "GET_MEM" => AckKind::GetMem,
            other => AckKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Sync => f.write_str("SYNC"),
            AckKind::Set => f.write_str("SET"),
            AckKind::Fetch => f.write_str("FETCH"),
            AckKind::Reset => f.write_str("RESET"),
            AckKind::GetMem => f.write_str("GET_MEM"),
            AckKind::Other(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub raw: String,
    pub free_bytes: Option<u64>,
    pub samples_that_fit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Searching,
    Connecting,
    Connected,
    Disconnected,
    NotFound,
    NotConnected,
    Busy,
    Error,
    Debug,
    Info,
    MalformedRecord,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl Status {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything the session worker hands to the consumer.
///
/// Device lines are classified into these variants by
/// [`classify`](crate::protocol::classify); the worker adds its own
/// `Status` entries for connection and write diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Ack { kind: AckKind },
    BlockWait { block: BlockId },
    EndOfStream,
    MemoryReport(MemoryReport),
    Status(Status),
    DataRecord { fields: Vec<String> },
}

impl Event {
    pub fn status(kind: StatusKind, message: impl Into<String>) -> Self {
        Event::Status(Status::new(kind, message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected after a failed connect attempt.
    Failed,
}
