//! AWS IoT thing bridge
//!
//! Wraps one MQTT connection to the AWS IoT data endpoint of a registered
//! thing. Deliveries on the thing's shadow topics come out of
//! [`Thing::inbound`]; reported state goes in through [`Thing::outbound`] and
//! is published as a shadow update.

pub mod bridge;
pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod link;
pub mod message;
pub mod session;

pub use bridge::{ShadowPublisher, Thing, ThingState};
pub use config::{ThingConfig, ThingSettings};
pub use credential::Credential;
pub use error::ThingError;
pub use identity::Identity;
pub use link::{BrokerLink, LinkEvent, RumqttLink};
pub use message::{reported_state, InboundMessage, ReportedState};
