//! Sender-side connection state machine.
//!
//! Provides a `ConnectionState` enum that models the lifecycle of the
//! outbound link, with validated transitions that return `Result`
//! instead of panicking.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::LinkError;

// ── ConnectionState ──────────────────────────────────────────────

/// The current state of the outbound link.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///                      ▲  │            │
///                      │  ▼            ▼
///                   BackoffWait ◄──────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no attempt scheduled. Initial / terminal state.
    #[default]
    Disconnected,

    /// TCP connect or handshake in progress.
    Connecting,

    /// Handshake complete; the drain loop is transmitting.
    Connected {
        /// When the link entered the `Connected` state.
        since: Instant,
    },

    /// Waiting before the next connection attempt.
    BackoffWait {
        /// How long this wait lasts.
        delay: Duration,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::BackoffWait { delay } => write!(f, "BackoffWait({delay:?})"),
        }
    }
}

impl ConnectionState {
    /// Returns `true` when the drain loop may transmit.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the link has been in the `Connected` state.
    ///
    /// Returns `None` for any other state.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected` (start), `BackoffWait` (delay elapsed).
    pub fn begin_connect(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Disconnected | Self::BackoffWait { .. } => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(LinkError::InvalidTransition(
                "cannot connect: not in Disconnected or BackoffWait state",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_handshake(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LinkError::InvalidTransition(
                "cannot complete handshake: not in Connecting state",
            )),
        }
    }

    /// Transition to `BackoffWait` after a send/receive/connect failure.
    ///
    /// Valid from: `Connecting`, `Connected`.
    pub fn fail(&mut self, delay: Duration) -> Result<(), LinkError> {
        match self {
            Self::Connecting | Self::Connected { .. } => {
                *self = Self::BackoffWait { delay };
                Ok(())
            }
            _ => Err(LinkError::InvalidTransition(
                "cannot back off: not in Connecting or Connected state",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Used by `stop()`.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────
