//! Broker link: the only code that touches the MQTT client
//!
//! The run loop talks to the broker exclusively through [`BrokerLink`]. The
//! production implementation, [`RumqttLink`], drives a `rumqttc` event loop on
//! a dedicated poller task and hands its events over a channel, which keeps
//! [`BrokerLink::next_event`] cancellation safe for use inside `select!`.
//!
//! ```text
//! Session ──publish/subscribe──► AsyncClient ──requests──► EventLoop
//!    ▲                                                        │
//!    └──────────── next_event ◄── mpsc ◄── poller task ◄──────┘
//! ```

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use rustls::ClientConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ThingSettings;
use super::error::ThingError;
use super::identity::{Identity, BROKER_PORT};
use super::message::InboundMessage;

const LINK_EVENT_BUFFER: usize = 100;

/// Something the broker did that the run loop has to react to
#[derive(Debug)]
pub enum LinkEvent {
    /// A publish matching the subscribed filter
    Delivery(InboundMessage),

    /// The session ended from the broker side
    Disconnected(String),
}

/// Authenticated session with a pub/sub broker
///
/// Implementations are owned by exactly one run loop and are never shared.
#[async_trait]
pub trait BrokerLink: Send {
    /// Connects and returns once the broker accepted the session
    async fn open(&mut self) -> Result<(), ThingError>;

    /// Subscribes at QoS 0 and returns once the broker acknowledged it
    async fn subscribe(&mut self, filter: &str) -> Result<(), ThingError>;

    /// Publishes at QoS 0 without retain
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ThingError>;

    /// Waits for the next delivery or disconnect; must be cancellation safe
    async fn next_event(&mut self) -> Result<LinkEvent, ThingError>;

    /// Releases the session; never fails
    async fn close(&mut self);
}

/// [`BrokerLink`] backed by a `rumqttc` client over mutual TLS
pub struct RumqttLink {
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    events: Option<mpsc::Receiver<Result<Event, ConnectionError>>>,
    poller: Option<JoinHandle<()>>,
    pending: VecDeque<InboundMessage>,
    disconnect_grace: Duration,
}

impl RumqttLink {
    /// Prepares a client for the thing's regional endpoint; does not connect
    pub fn new(identity: &Identity, tls: Arc<ClientConfig>, settings: &ThingSettings) -> Self {
        let mut mqtt_options =
            MqttOptions::new(identity.name(), identity.broker_host(), BROKER_PORT);
        mqtt_options
            .set_keep_alive(Duration::from_secs(settings.keep_alive_secs))
            .set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls)));

        let (client, eventloop) = AsyncClient::new(mqtt_options, settings.request_capacity.max(1));

        RumqttLink {
            client,
            eventloop: Some(eventloop),
            events: None,
            poller: None,
            pending: VecDeque::new(),
            disconnect_grace: Duration::from_millis(settings.disconnect_grace_ms),
        }
    }

    async fn recv_raw(&mut self) -> Option<Result<Event, ConnectionError>> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }
}

// Polls until the first error or the outgoing DISCONNECT; rumqttc would
// reconnect on the next poll otherwise.
fn spawn_poller(
    mut eventloop: EventLoop,
    events: mpsc::Sender<Result<Event, ConnectionError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut forwarding = true;
        loop {
            let event = eventloop.poll().await;
            let finished = matches!(event, Err(_) | Ok(Event::Outgoing(Outgoing::Disconnect)));

            if forwarding && events.send(event).await.is_err() {
                debug!("Link dropped its event receiver, draining event loop");
                forwarding = false;
            }
            if finished {
                debug!("MQTT event loop poller finished");
                break;
            }
        }
    })
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn open(&mut self) -> Result<(), ThingError> {
        let eventloop = self.eventloop.take().ok_or(ThingError::AlreadyStarted)?;
        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        self.events = Some(event_rx);
        self.poller = Some(spawn_poller(eventloop, event_tx));

        loop {
            match self.recv_raw().await {
                Some(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        info!("Broker accepted connection");
                        Ok(())
                    } else {
                        Err(ThingError::Connection(format!(
                            "Broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Some(Ok(event)) => debug!("Event before CONNACK: {:?}", event),
                Some(Err(e)) => return Err(ThingError::Connection(e.to_string())),
                None => {
                    return Err(ThingError::Connection(
                        "Event loop ended before CONNACK".to_string(),
                    ))
                }
            }
        }
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), ThingError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| ThingError::Connection(e.to_string()))?;

        loop {
            match self.recv_raw().await {
                Some(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    if ack.return_codes.contains(&SubscribeReasonCode::Failure) {
                        return Err(ThingError::Connection(format!(
                            "Broker rejected subscription to {}",
                            filter
                        )));
                    }
                    info!("Subscribed to {}", filter);
                    return Ok(());
                }
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    // Early deliveries are kept for next_event.
                    self.pending.push_back(InboundMessage::from_topic(
                        publish.topic,
                        publish.payload.to_vec(),
                    ));
                }
                Some(Ok(event)) => debug!("Event before SUBACK: {:?}", event),
                Some(Err(e)) => return Err(ThingError::Connection(e.to_string())),
                None => {
                    return Err(ThingError::Connection(
                        "Event loop ended before SUBACK".to_string(),
                    ))
                }
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ThingError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| ThingError::Publish(e.to_string()))
    }

    async fn next_event(&mut self) -> Result<LinkEvent, ThingError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(LinkEvent::Delivery(msg));
        }

        loop {
            match self.recv_raw().await {
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    return Ok(LinkEvent::Delivery(InboundMessage::from_topic(
                        publish.topic,
                        publish.payload.to_vec(),
                    )));
                }
                Some(Ok(Event::Incoming(Packet::Disconnect))) => {
                    return Ok(LinkEvent::Disconnected(
                        "Broker sent DISCONNECT".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ok(LinkEvent::Disconnected(e.to_string())),
                None => {
                    return Ok(LinkEvent::Disconnected(
                        "Event loop stopped".to_string(),
                    ))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        // Dropping the receiver lets the poller finish without a reader.
        self.events = None;

        if let Some(mut poller) = self.poller.take() {
            if tokio::time::timeout(self.disconnect_grace, &mut poller)
                .await
                .is_err()
            {
                warn!(
                    "MQTT event loop did not finish within {:?}, aborting",
                    self.disconnect_grace
                );
                poller.abort();
            }
        }
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::thing::credential::{fixtures, Credential};

    fn link() -> RumqttLink {
        let identity = Identity::new("sprk-1", "us-east-2").unwrap();
        let tls = Credential::new(fixtures::RSA_KEY, fixtures::RSA_CERT)
            .client_config()
            .unwrap();
        RumqttLink::new(&identity, Arc::new(tls), &ThingSettings::default())
    }

    #[tokio::test]
    async fn open_without_event_loop_is_rejected() {
        let mut link = link();
        // Take the event loop without touching the network.
        link.eventloop = None;
        assert!(matches!(link.open().await, Err(ThingError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn next_event_without_poller_reports_disconnect() {
        let mut link = link();
        match link.next_event().await {
            Ok(LinkEvent::Disconnected(reason)) => assert_eq!(reason, "Event loop stopped"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_deliveries_come_first() {
        let mut link = link();
        link.pending
            .push_back(InboundMessage::from_topic("$aws/things/sprk-1/shadow/get", b"{}".to_vec()));

        match link.next_event().await {
            Ok(LinkEvent::Delivery(msg)) => assert_eq!(msg.topic, "$aws/things/sprk-1/shadow/get"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_without_open_returns() {
        let mut link = link();
        link.close().await;
        assert!(link.poller.is_none());
    }
}
