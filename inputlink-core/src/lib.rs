//! # inputlink-core
//!
//! Core library for forwarding game-controller input from a sender host to
//! a receiver host over a local network.
//!
//! This crate contains:
//! - **Sample model**: `ControllerSample`, `Buttons`, `Axes`, `AxisFilter`
//! - **Protocol**: `Envelope`, typed payloads, `encode` / `decode`
//! - **Codec**: `LinkCodec` for framed TCP I/O via `tokio_util`
//! - **Capture**: `CaptureScheduler` polling a `HardwareSource` at a fixed rate
//! - **Sender link**: `OutboundLink` with a bounded drop-oldest `OutboundQueue`
//!   and exponential `Backoff`
//! - **Receiver**: `InboundServer` sessions feeding a `DeviceRegistry`
//!   driven through a `VirtualDeviceCapability`
//! - **Events**: `EventBus` status notifications
//! - **Error**: `LinkError`, a `thiserror`-based error taxonomy

pub mod backoff;
pub mod buttons;
pub mod capture;
pub mod codec;
pub mod config;
pub mod device;
pub mod envelope;
pub mod error;
pub mod events;
pub mod header;
pub mod message;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod sample;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use backoff::{Backoff, BackoffPolicy};
pub use buttons::Buttons;
pub use capture::{CaptureScheduler, CaptureSnapshot, ClaimSet, HardwareSource, TickSchedule};
pub use codec::{LinkCodec, MAX_FRAME_SIZE};
pub use config::{ControllerConfig, ReceiverConfig, SenderConfig};
pub use device::{
    DeviceRegistry, DeviceSnapshot, DeviceState, DispatchOutcome, RegistryStats,
    VirtualDeviceCapability,
};
pub use envelope::{Envelope, PROTOCOL_VERSION, Payload, ProtocolVersion, decode, encode};
pub use error::{ErrorKind, LinkError};
pub use events::{EventBus, LinkEvent, SessionId};
pub use header::{FrameHeader, HEADER_SIZE};
pub use message::MessageKind;
pub use network::{Connection, Endpoint, InboundServer, LinkSnapshot, OutboundLink, SessionInfo};
pub use queue::{OutboundQueue, QueuedEnvelope};
pub use sample::{
    Axes, AxisFilter, ControllerSample, InputMethod, MAX_CONTROLLER_NUMBER, RawControllerState,
};
pub use state::ConnectionState;
