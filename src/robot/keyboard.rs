//! Keyboard drive loop
//!
//! Arrow keys roll the robot, Escape (or Ctrl+C, raw mode swallows SIGINT)
//! ends the loop. Keys are read on a blocking thread and handed over a channel.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Robot, RobotError};

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default roll speed of the drive loop
pub const DRIVE_SPEED: u8 = 40;

/// Keys the drive loop reacts to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveKey {
    Up,
    Down,
    Left,
    Right,
    Escape,
    Other,
}

/// What the drive loop does for a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveAction {
    Roll { speed: u8, heading: u16 },
    Quit,
    Ignore,
}

impl From<KeyEvent> for DriveKey {
    fn from(key: KeyEvent) -> Self {
        match key.code {
            KeyCode::Up => DriveKey::Up,
            KeyCode::Down => DriveKey::Down,
            KeyCode::Left => DriveKey::Left,
            KeyCode::Right => DriveKey::Right,
            KeyCode::Esc => DriveKey::Escape,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                DriveKey::Escape
            }
            _ => DriveKey::Other,
        }
    }
}

/// Maps a key to a drive action; headings are clockwise from straight ahead
pub fn action_for(key: DriveKey, speed: u8) -> DriveAction {
    match key {
        DriveKey::Up => DriveAction::Roll { speed, heading: 0 },
        DriveKey::Right => DriveAction::Roll { speed, heading: 90 },
        DriveKey::Down => DriveAction::Roll { speed, heading: 180 },
        DriveKey::Left => DriveAction::Roll { speed, heading: 270 },
        DriveKey::Escape => DriveAction::Quit,
        DriveKey::Other => DriveAction::Ignore,
    }
}

// Restores cooked mode on every exit path, panics included.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self, RobotError> {
        terminal::enable_raw_mode()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

fn read_keys(keys: mpsc::Sender<Result<DriveKey, std::io::Error>>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let key = match event::poll(KEY_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => Ok(DriveKey::from(key)),
                Ok(_) => continue,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let failed = key.is_err();
        if keys.blocking_send(key).is_err() || failed {
            break;
        }
    }
    debug!("Key reader stopped");
}

/// Drives `robot` with the arrow keys until Escape or `cancel`
///
/// # Errors
///
/// [`RobotError::Terminal`] if raw mode cannot be entered or reading keys
/// fails, or any error the robot returns for a roll command.
pub async fn drive(
    robot: Arc<dyn Robot>,
    speed: u8,
    cancel: CancellationToken,
) -> Result<(), RobotError> {
    let _raw_mode = RawModeGuard::enable()?;
    info!("Driving {} with the arrow keys, Esc quits", robot.name());

    let (keys_tx, mut keys_rx) = mpsc::channel(16);
    let reader_cancel = cancel.child_token();
    let reader = {
        let reader_cancel = reader_cancel.clone();
        tokio::task::spawn_blocking(move || read_keys(keys_tx, reader_cancel))
    };

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            key = keys_rx.recv() => match key {
                Some(Ok(key)) => match action_for(key, speed) {
                    DriveAction::Roll { speed, heading } => {
                        if let Err(e) = robot.roll(speed, heading) {
                            break Err(e);
                        }
                    }
                    DriveAction::Quit => break Ok(()),
                    DriveAction::Ignore => {}
                },
                Some(Err(e)) => break Err(RobotError::Terminal(e)),
                None => break Ok(()),
            }
        }
    };

    reader_cancel.cancel();
    drop(keys_rx);
    if let Err(e) = reader.await {
        warn!("Key reader task failed: {}", e);
    }
    result
}
