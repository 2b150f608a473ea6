//! The thing bridge: one broker connection, two channels, acknowledged stop
//!
//! # Architecture
//!
//! ```text
//!  ShadowPublisher ──► outbound (cap 1) ──┐
//!                                         ▼
//!                               ShadowSession run loop ◄──► BrokerLink ◄──► AWS IoT
//!                                         │
//!  inbound() receiver ◄── inbound (cap N) ┘
//!
//!  stop() ──► oneshot(StopRequest) ──► run loop ──► ack after release
//! ```
//!
//! `connect` blocks its task for the whole session, so callers spawn it and
//! talk to the thing only through the channels and [`Thing::stop`].

use rustls::ClientConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::{ThingConfig, ThingSettings};
use super::error::ThingError;
use super::identity::Identity;
use super::link::{BrokerLink, RumqttLink};
use super::message::{reported_state, InboundMessage, ReportedState};
use super::session::{RunOutcome, ShadowSession, StopRequest};

const OUTBOUND_CAPACITY: usize = 1;

/// Lifecycle of a [`Thing`]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ThingState {
    #[default]
    Constructed,
    Connecting,
    Running,
    Stopped,
    Failed,
}

// Run-loop ends of the channels, taken by the first connect
struct RunParts {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_rx: mpsc::Receiver<ReportedState>,
    stop_rx: oneshot::Receiver<StopRequest>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Message bridge between the application and the thing's device shadow
pub struct Thing {
    identity: Identity,
    tls: Arc<ClientConfig>,
    settings: ThingSettings,
    status: watch::Sender<ThingState>,
    outbound_tx: mpsc::Sender<ReportedState>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    stop_tx: Mutex<Option<oneshot::Sender<StopRequest>>>,
    run_parts: Mutex<Option<RunParts>>,
}

impl Thing {
    /// Validates the credential and prepares the channels; no network I/O
    ///
    /// # Errors
    ///
    /// [`ThingError::InvalidCredential`] if key and certificate are unusable.
    pub fn new(config: ThingConfig) -> Result<Self, ThingError> {
        let tls = config.credential.client_config()?;
        info!(
            "Thing {} configured for {}",
            config.identity,
            config.identity.broker_url()
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(config.settings.inbound_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (status, _) = watch::channel(ThingState::Constructed);

        Ok(Self {
            identity: config.identity,
            tls: Arc::new(tls),
            settings: config.settings,
            status,
            outbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            run_parts: Mutex::new(Some(RunParts {
                inbound_tx,
                outbound_rx,
                stop_rx,
            })),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Connects to AWS IoT and runs until stopped
    ///
    /// Returns `Ok(())` only after a clean [`stop`](Self::stop).
    pub async fn connect(&self) -> Result<(), ThingError> {
        let link = RumqttLink::new(&self.identity, self.tls.clone(), &self.settings);
        self.connect_over(Box::new(link)).await
    }

    /// Runs the bridge lifecycle over the given broker link
    pub async fn connect_over(&self, link: Box<dyn BrokerLink>) -> Result<(), ThingError> {
        let RunParts {
            inbound_tx,
            outbound_rx,
            mut stop_rx,
        } = lock(&self.run_parts)
            .take()
            .ok_or(ThingError::AlreadyStarted)?;

        self.set_state(ThingState::Connecting);
        let session = ShadowSession::create(link, self.identity.clone(), inbound_tx, outbound_rx);

        let running = match session.establish().await {
            Ok(running) => running,
            Err(e) => {
                self.set_state(ThingState::Failed);
                return Err(match e {
                    ThingError::Connection(_) => e,
                    other => ThingError::Connection(other.to_string()),
                });
            }
        };
        self.set_state(ThingState::Running);

        let (closing, outcome) = running.run_until_stopped(&mut stop_rx).await;
        // Late stop requests must see a dropped receiver, not wait on it.
        drop(stop_rx);
        lock(&self.stop_tx).take();
        closing.close().await;

        match outcome {
            RunOutcome::Stopped(ack) => {
                self.set_state(ThingState::Stopped);
                if let Some(ack) = ack {
                    if ack.send(()).is_err() {
                        debug!("Stop caller went away before the acknowledgement");
                    }
                }
                info!("Thing {} stopped", self.identity);
                Ok(())
            }
            RunOutcome::Disconnected(reason) => {
                self.set_state(ThingState::Stopped);
                Err(ThingError::Disconnected(reason))
            }
            RunOutcome::Failed(e) => {
                self.set_state(ThingState::Failed);
                error!("Thing {} failed: {}", self.identity, e);
                Err(e)
            }
        }
    }

    /// Stops a running bridge and waits until the connection is released
    ///
    /// # Errors
    ///
    /// [`ThingError::NotRunning`] if the bridge is not running, or has already
    /// left its run loop by the time the request arrives.
    pub async fn stop(&self) -> Result<(), ThingError> {
        if self.current_state() != ThingState::Running {
            return Err(ThingError::NotRunning);
        }
        let stop_tx = lock(&self.stop_tx).take().ok_or(ThingError::NotRunning)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).is_err() {
            warn!("Stop request for {} found no run loop", self.identity);
            return Err(ThingError::NotRunning);
        }

        ack_rx.await.map_err(|_| ThingError::NotRunning)
    }

    /// Receive end of broker deliveries; can be taken once
    pub fn inbound(&self) -> Result<mpsc::Receiver<InboundMessage>, ThingError> {
        lock(&self.inbound_rx).take().ok_or(ThingError::InboundTaken)
    }

    /// Send-only handle for shadow updates
    pub fn outbound(&self) -> ShadowPublisher {
        ShadowPublisher {
            tx: self.outbound_tx.clone(),
            status: self.status.subscribe(),
        }
    }

    /// Watches the lifecycle
    pub fn state(&self) -> watch::Receiver<ThingState> {
        self.status.subscribe()
    }

    pub fn current_state(&self) -> ThingState {
        *self.status.borrow()
    }

    fn set_state(&self, state: ThingState) {
        debug!("Thing {} is now {:?}", self.identity, state);
        self.status.send_replace(state);
    }
}

/// Cloneable producer of shadow updates for one [`Thing`]
#[derive(Clone, Debug)]
pub struct ShadowPublisher {
    tx: mpsc::Sender<ReportedState>,
    status: watch::Receiver<ThingState>,
}

impl ShadowPublisher {
    /// Queues reported fields for publishing, waiting for buffer space
    ///
    /// # Errors
    ///
    /// [`ThingError::NotRunning`] outside the running state,
    /// [`ThingError::ChannelClosed`] if the run loop ended while waiting.
    pub async fn send(&self, state: ReportedState) -> Result<(), ThingError> {
        if *self.status.borrow() != ThingState::Running {
            return Err(ThingError::NotRunning);
        }
        self.tx
            .send(state)
            .await
            .map_err(|_| ThingError::ChannelClosed)
    }

    /// Serializes `value` into reported fields and queues it
    pub async fn send_state<T: Serialize>(&self, value: &T) -> Result<(), ThingError> {
        self.send(reported_state(value)?).await
    }

    /// Waits until the thing is running; false if it ended first
    pub async fn wait_running(&mut self) -> bool {
        self.status
            .wait_for(|s| matches!(s, ThingState::Running | ThingState::Stopped | ThingState::Failed))
            .await
            .map(|state| *state == ThingState::Running)
            .unwrap_or(false)
    }
}
