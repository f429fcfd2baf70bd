//! # Warden Events
//!
//! This crate defines the real-time fan-out vocabulary: the channels commands
//! and notifications travel on, the events themselves, and the `Publisher`
//! collaborator with its in-process broadcast implementation.
//!
//! As a Layer 0 crate, it depends only on `core-types`.

// Declare the modules that make up this crate.
pub mod channel;
pub mod error;
pub mod messages;
pub mod publisher;

// Re-export the core types to provide a clean public API.
pub use channel::Channel;
pub use error::EventsError;
pub use messages::{
    CommandDelivery, CommandStatusUpdate, EmergencyStopNotice, FanoutEvent, RiskAlert,
    ViolationNotice,
};
pub use publisher::{BroadcastPublisher, ChannelSubscription, Envelope, Publisher};
