use serde::{Deserialize, Serialize};

use super::credential::Credential;
use super::identity::Identity;

/// Tuning knobs of the bridge; every field has a working default
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThingSettings {
    /// MQTT keep alive in seconds
    pub keep_alive_secs: u64,

    /// Deliveries buffered for the inbound consumer before the run loop waits
    pub inbound_buffer: usize,

    /// Requests the MQTT client queues towards its event loop
    pub request_capacity: usize,

    /// Time the event loop gets to flush DISCONNECT before it is aborted
    pub disconnect_grace_ms: u64,
}

impl Default for ThingSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            inbound_buffer: 100,
            request_capacity: 10,
            disconnect_grace_ms: 100,
        }
    }
}

/// Everything needed to construct a [`Thing`](super::Thing)
#[derive(Clone, Debug)]
pub struct ThingConfig {
    pub identity: Identity,
    pub credential: Credential,
    pub settings: ThingSettings,
}

impl ThingConfig {
    pub fn new(identity: Identity, credential: Credential) -> Self {
        Self {
            identity,
            credential,
            settings: ThingSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ThingSettings) -> Self {
        self.settings = settings;
        self
    }
}
