//! Robot collaborator
//!
//! The drive loop and the colour cycle only ever talk to the [`Robot`] trait,
//! so a BLE driver for a real SPRK+ can replace [`SimulatedSprk`] without
//! touching them.

pub mod keyboard;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 64;

/// Errors reported by a robot adapter or the drive loop
#[derive(Debug, Error)]
pub enum RobotError {
    /// Heading outside 0..360 degrees
    #[error("Invalid heading: {0}")]
    InvalidHeading(u16),

    /// The robot no longer accepts commands
    #[error("Robot {0} is offline")]
    Offline(String),

    /// The terminal reported an error while reading keys
    #[error("Terminal error: {0}")]
    Terminal(#[from] std::io::Error),
}

/// Something the robot reports back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RobotEvent {
    ColorChanged { red: u8, green: u8, blue: u8 },
    Rolling { speed: u8, heading: u16 },
    PoweredOff,
}

/// Movement and colour capabilities of a toy robot
pub trait Robot: Send + Sync {
    fn name(&self) -> &str;

    /// Sets the main LED colour
    fn set_color(&self, red: u8, green: u8, blue: u8) -> Result<(), RobotError>;

    /// Rolls at `speed` towards `heading` degrees, 0 being straight ahead
    ///
    /// # Errors
    ///
    /// [`RobotError::InvalidHeading`] for headings of 360 or more.
    fn roll(&self, speed: u8, heading: u16) -> Result<(), RobotError>;

    /// Subscribes to the robot's event stream
    fn events(&self) -> broadcast::Receiver<RobotEvent>;
}

#[derive(Debug, Default)]
struct SimulatedState {
    commands: Vec<RobotEvent>,
    offline: bool,
}

/// In-process SPRK+ stand-in that logs and records every command
#[derive(Debug)]
pub struct SimulatedSprk {
    name: String,
    state: Mutex<SimulatedState>,
    events: broadcast::Sender<RobotEvent>,
}

impl SimulatedSprk {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            name: name.into(),
            state: Mutex::new(SimulatedState::default()),
            events,
        }
    }

    /// Commands accepted so far, oldest first
    pub fn commands(&self) -> Vec<RobotEvent> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commands
            .clone()
    }

    /// Stops accepting commands
    pub fn power_off(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offline = true;
        info!("{} powered off", self.name);
        self.emit(RobotEvent::PoweredOff);
    }

    fn apply(&self, event: RobotEvent) -> Result<(), RobotError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.offline {
                return Err(RobotError::Offline(self.name.clone()));
            }
            state.commands.push(event);
        }
        debug!("{}: {:?}", self.name, event);
        self.emit(event);
        Ok(())
    }

    fn emit(&self, event: RobotEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Robot for SimulatedSprk {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_color(&self, red: u8, green: u8, blue: u8) -> Result<(), RobotError> {
        self.apply(RobotEvent::ColorChanged { red, green, blue })
    }

    fn roll(&self, speed: u8, heading: u16) -> Result<(), RobotError> {
        if heading >= 360 {
            return Err(RobotError::InvalidHeading(heading));
        }
        self.apply(RobotEvent::Rolling { speed, heading })
    }

    fn events(&self) -> broadcast::Receiver<RobotEvent> {
        self.events.subscribe()
    }
}

/// Sets a random colour every `interval` until cancelled
pub async fn color_cycle(
    robot: Arc<dyn Robot>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), RobotError> {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Colour cycle for {} cancelled", robot.name());
                return Ok(());
            }
            _ = ticker.tick() => {
                robot.set_color(rand::random(), rand::random(), rand::random())?;
            }
        }
    }
}

/// Logs every event of `robot` until its event stream closes or `cancel` fires
pub async fn log_events(robot: Arc<dyn Robot>, cancel: CancellationToken) {
    let mut events = robot.events();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => info!("BOT EVENT: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} events of {}", skipped, robot.name());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
