//! # inputlink-receiver: Virtual Controller Service
//!
//! Runs on the machine the games run on. Accepts any number of senders,
//! and re-materializes every controller they forward as a virtual
//! device through a [`inputlink_core::VirtualDeviceCapability`].
//!
//! The bundled [`service::TracingCapability`] logs device activity
//! instead of driving a platform bus; it is the default backend and the
//! one used in tests.

pub mod config;
pub mod service;
