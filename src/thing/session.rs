//! Shadow session with statum state machine
//!
//! The run loop of a [`Thing`](super::Thing). A session exclusively owns the
//! broker link and the run-loop ends of both channels; nothing else touches
//! the connection while it exists.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──establish──► Running ──run_until_stopped──► Closing ──close──► (released)
//!     │                                                        ▲
//!     └────────────── open/subscribe failed: link closed ──────┘
//! ```

use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::error::ThingError;
use super::identity::Identity;
use super::link::{BrokerLink, LinkEvent};
use super::message::{shadow_update, InboundMessage, ReportedState};

/// Stop request: carries the acknowledgement sent once the connection is released
pub type StopRequest = oneshot::Sender<()>;

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connecting,
    Running,
    Closing,
}

/// Why a running session left its loop
#[derive(Debug)]
pub enum RunOutcome {
    /// `stop` was called; the acknowledgement is missing if the thing went away
    Stopped(Option<StopRequest>),

    /// The broker or the network ended the session
    Disconnected(String),

    /// A publish could not be encoded or handed to the client
    Failed(ThingError),
}

#[machine]
pub struct ShadowSession<S: SessionState> {
    link: Box<dyn BrokerLink>,
    identity: Identity,
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_rx: mpsc::Receiver<ReportedState>,
    forwarded: u64,
    published: u64,
}

impl ShadowSession<Connecting> {
    pub fn create(
        link: Box<dyn BrokerLink>,
        identity: Identity,
        inbound_tx: mpsc::Sender<InboundMessage>,
        outbound_rx: mpsc::Receiver<ReportedState>,
    ) -> Self {
        debug!("Creating shadow session for {}", identity);

        Self::new(link, identity, inbound_tx, outbound_rx, 0, 0)
    }

    /// Connects and subscribes to the shadow filter
    ///
    /// On failure the link is closed before the error is returned.
    pub async fn establish(mut self) -> Result<ShadowSession<Running>, ThingError> {
        info!("Connecting to {}", self.identity.broker_url());

        if let Err(e) = self.link.open().await {
            error!("Connection to {} failed: {}", self.identity.broker_url(), e);
            self.link.close().await;
            return Err(e);
        }

        let filter = self.identity.shadow_filter();
        if let Err(e) = self.link.subscribe(&filter).await {
            error!("Subscribing to {} failed: {}", filter, e);
            self.link.close().await;
            return Err(e);
        }

        info!("Shadow session running for {}", self.identity);
        Ok(self.transition())
    }
}

impl ShadowSession<Running> {
    async fn publish(&mut self, state: ReportedState) -> Result<(), ThingError> {
        let body = shadow_update(&state)?;
        let topic = self.identity.update_topic();
        debug!("Publishing {} bytes to {}", body.len(), topic);

        self.link.publish(&topic, body).await?;
        self.published += 1;
        Ok(())
    }

    /// Publishes every update accepted before the stop request
    ///
    /// The outbound channel is closed first, so later sends fail instead of
    /// queueing behind the stop.
    async fn flush_outbound(&mut self, ack: Option<StopRequest>) -> RunOutcome {
        self.outbound_rx.close();
        while let Some(state) = self.outbound_rx.recv().await {
            if let Err(e) = self.publish(state).await {
                error!("Publishing queued shadow update failed: {}", e);
                return RunOutcome::Failed(e);
            }
        }
        RunOutcome::Stopped(ack)
    }

    /// Runs until a stop request, a broker disconnect or a failed publish
    pub async fn run_until_stopped(
        mut self,
        stop_rx: &mut oneshot::Receiver<StopRequest>,
    ) -> (ShadowSession<Closing>, RunOutcome) {
        info!("Starting shadow run loop for {}", self.identity);

        let outcome = loop {
            tokio::select! {
                request = &mut *stop_rx => {
                    info!("Stop requested for {}", self.identity);
                    break self.flush_outbound(request.ok()).await;
                }

                Some(state) = self.outbound_rx.recv() => {
                    if let Err(e) = self.publish(state).await {
                        error!("Publishing shadow update failed: {}", e);
                        break RunOutcome::Failed(e);
                    }
                }

                event = self.link.next_event() => match event {
                    Ok(LinkEvent::Delivery(msg)) => {
                        if let Some(request) = forward_inbound(&self.inbound_tx, msg, stop_rx).await {
                            info!("Stop requested for {} while forwarding", self.identity);
                            break self.flush_outbound(request).await;
                        }
                        self.forwarded += 1;
                    }
                    Ok(LinkEvent::Disconnected(reason)) => {
                        warn!("Broker ended session for {}: {}", self.identity, reason);
                        break RunOutcome::Disconnected(reason);
                    }
                    Err(e) => {
                        warn!("Broker link failed for {}: {}", self.identity, e);
                        break RunOutcome::Disconnected(e.to_string());
                    }
                },
            }
        };

        info!(
            "Run loop for {} finished after {} published, {} forwarded",
            self.identity, self.published, self.forwarded
        );
        (self.transition(), outcome)
    }
}

/// Hands one delivery to the inbound consumer
///
/// Waits for buffer space but gives up as soon as a stop request arrives, which
/// is then returned. A consumer that dropped its receiver loses the message.
async fn forward_inbound(
    inbound_tx: &mpsc::Sender<InboundMessage>,
    msg: InboundMessage,
    stop_rx: &mut oneshot::Receiver<StopRequest>,
) -> Option<Option<StopRequest>> {
    tokio::select! {
        biased;

        request = &mut *stop_rx => Some(request.ok()),

        sent = inbound_tx.send(msg) => {
            if let Err(mpsc::error::SendError(dropped)) = sent {
                warn!("Inbound receiver dropped, discarding {}", dropped);
            }
            None
        }
    }
}

impl ShadowSession<Closing> {
    /// Releases the connection and both channel ends
    pub async fn close(mut self) {
        debug!("Closing shadow session for {}", self.identity);

        self.outbound_rx.close();
        while let Ok(state) = self.outbound_rx.try_recv() {
            warn!(
                "Discarding shadow update queued after the run loop ended: {}",
                serde_json::Value::Object(state)
            );
        }

        self.link.close().await;
        info!("Disconnected {} from {}", self.identity, self.identity.broker_url());
    }
}
