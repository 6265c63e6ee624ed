//! Typed payload definitions carried inside [`Envelope`]s.
//!
//! INPUT carries a [`ControllerSample`] directly; every other kind has
//! its payload defined in [`control`].
//!
//! [`Envelope`]: crate::envelope::Envelope
//! [`ControllerSample`]: crate::sample::ControllerSample

pub mod control;

pub use control::{
    ErrorCode, ErrorPayload, Health, HelloPayload, PingPayload, PongPayload, StatusPayload,
};
