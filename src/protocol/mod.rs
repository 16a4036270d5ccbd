//! Device text protocol: outbound commands and inbound line classification.

mod classify;

pub use classify::{classify, parse_record, ClassifyContext, RecordRejected};

use crate::model::{AckKind, BlockId};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

/// On-wire size of one telemetry record, e.g. `1747410717.502,122,397,260\n`.
pub const RECORD_WIRE_SIZE: u64 = 27;

pub const BUFFER_RANGE: RangeInclusive<u32> = 1..=4000;
pub const FREQ_RANGE: RangeInclusive<u32> = 1..=10;

const SYNC_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetMem,
    Sync(NaiveDateTime),
    Set { buffer: u32, freq: u32 },
    Fetch,
    Reset,
    AckBlock(BlockId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    GetMem,
    Sync,
    Set,
    Fetch,
    Reset,
    AckBlock,
}

/// What the device sends back once it has handled a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(AckKind),
    MemoryReport,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("buffer size {0} out of range 1..=4000")]
    BufferOutOfRange(u32),
    #[error("sample rate {0} Hz out of range 1..=10")]
    FreqOutOfRange(u32),
}

impl Command {
    pub fn configure(buffer: u32, freq: u32) -> Result<Self, CommandError> {
        if !BUFFER_RANGE.contains(&buffer) {
            return Err(CommandError::BufferOutOfRange(buffer));
        }
        if !FREQ_RANGE.contains(&freq) {
            return Err(CommandError::FreqOutOfRange(freq));
        }
        Ok(Command::Set { buffer, freq })
    }

    pub fn sync_now() -> Self {
        Command::Sync(Local::now().naive_local())
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::GetMem => CommandKind::GetMem,
            Command::Sync(_) => CommandKind::Sync,
            Command::Set { .. } => CommandKind::Set,
            Command::Fetch => CommandKind::Fetch,
            Command::Reset => CommandKind::Reset,
            Command::AckBlock(_) => CommandKind::AckBlock,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Command::GetMem => "GET_MEM".to_string(),
            Command::Sync(at) => format!("SYNC:{}", at.format(SYNC_FORMAT)),
            Command::Set { buffer, freq } => format!("SET:{buffer},{freq}"),
            Command::Fetch => "FETCH".to_string(),
            Command::Reset => "RESET".to_string(),
            Command::AckBlock(block) => format!("ACK:BLOCK_{block}"),
        }
    }
}

impl CommandKind {
    pub fn expected_reply(self) -> Option<Reply> {
        match self {
            CommandKind::GetMem => Some(Reply::MemoryReport),
            CommandKind::Sync => Some(Reply::Ack(AckKind::Sync)),
            CommandKind::Set => Some(Reply::Ack(AckKind::Set)),
            CommandKind::Fetch => Some(Reply::Ack(AckKind::Fetch)),
            CommandKind::Reset => Some(Reply::Ack(AckKind::Reset)),
            CommandKind::AckBlock => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::GetMem => "GET_MEM",
            CommandKind::Sync => "SYNC",
            CommandKind::Set => "SET",
            CommandKind::Fetch => "FETCH",
            CommandKind::Reset => "RESET",
            CommandKind::AckBlock => "ACK:BLOCK",
        };
        f.write_str(name)
    }
}
