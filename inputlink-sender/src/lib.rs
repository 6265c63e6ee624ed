//! # inputlink-sender: Controller Capture Service
//!
//! Runs on the machine the physical controllers are plugged into. Polls
//! every configured controller at the configured rate, normalizes the
//! samples and streams them to an `inputlink-receiver` over one
//! persistent TCP connection, reconnecting with backoff when it drops.
//!
//! Hardware access sits behind [`inputlink_core::HardwareSource`]; this
//! crate ships a [`hardware::SyntheticSource`] that animates virtual pads
//! for demos and tests.

pub mod config;
pub mod hardware;
pub mod service;
