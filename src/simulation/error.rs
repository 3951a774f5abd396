//! Error taxonomy for the simulated medium.
//!
//! - `StationError::InvalidChannel` / `InvalidPower`: caller errors raised before
//!   anything is sent; the MAC policy may correct its request and retry.
//! - `InvariantViolation`: a broken protocol contract inside the core. Fatal.
//! - `PropagationError`: the injected path-loss function rejected its input.
//!
//! Interference is never an error: a corrupted transmission is reported as NOACK.

use thiserror::Error;

use super::types::{Reply, StationId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("station {station} sent START while a transmission was already in progress")]
    DuplicateStart { station: StationId },
    #[error("station {station} sent DONE without a transmission in progress")]
    DoneWithoutStart { station: StationId },
    #[error("event references unknown station {station}")]
    UnknownStation { station: StationId },
    #[error("station {station} used channel {channel} outside 1..=11")]
    ChannelOutOfRange { station: StationId, channel: u8 },
    #[error("station {station} received {reply} while waiting for {expected}")]
    UnexpectedReply {
        station: StationId,
        reply: Reply,
        expected: &'static str,
    },
    #[error("reply queue of station {station} is still full")]
    ReplyQueueFull { station: StationId },
    #[error("malformed event from station {station}: {detail}")]
    MalformedEvent { station: StationId, detail: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropagationError {
    #[error("invalid distance {0}, must be non-negative")]
    InvalidDistance(f32),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StationError {
    #[error("invalid channel {0}, must be in 1..=11")]
    InvalidChannel(u8),
    #[error("invalid tx power {0} dB, maximum is 20 dB")]
    InvalidPower(f32),
    #[error(transparent)]
    Violation(#[from] InvariantViolation),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Violation(#[from] InvariantViolation),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
}
