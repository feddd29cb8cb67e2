//! Error taxonomy (§7). One enum per failure domain, each implementing
//! `std::error::Error` via `thiserror` so the crate composes into a caller's
//! own error chain.

use thiserror::Error;

/// Errors raised while constructing or mutating a [`crate::packet::Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("payload of {len} bytes exceeds the {max} byte maximum")]
    Oversize { len: usize, max: usize },
    #[error("frame of {have} bytes is smaller than the {need} byte header")]
    Malformed { have: usize, need: usize },
}

/// Errors raised while constructing a [`crate::packet::DeviceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceIdError {
    #[error("device identifier must be exactly 8 bytes, got {len}")]
    WrongLength { len: usize },
}

/// Errors raised by [`crate::register_cache::RegisterCache`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("register query timed out with no report")]
    Timeout,
}

/// Errors raised by [`crate::ack::AckTracker`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("ack not received after exhausting retransmits")]
    Timeout,
}

/// Errors raised by [`crate::event_emitter::EventEmitter`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventEmitterError {
    #[error("no matching subscriber registered for this event")]
    NotSubscribed,
}
