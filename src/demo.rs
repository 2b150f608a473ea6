//! Publish/subscribe demo against a thing's device shadow
//!
//! Logs every shadow message the broker delivers, reports a colour state
//! periodically and stops the thing after a fixed delay.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::thing::{ShadowPublisher, Thing, ThingError};

/// Timing of the demo
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// Seconds between two colour reports
    pub publish_interval_secs: u64,

    /// Seconds after which the thing is stopped
    pub stop_after_secs: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            publish_interval_secs: 1,
            stop_after_secs: 5,
        }
    }
}

/// Colour reported to the shadow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    /// First colour the demo reports
    pub const DEMO: Color = Color {
        red: 187,
        green: 114,
        blue: 222,
    };

    pub fn random() -> Self {
        Color {
            red: rand::random(),
            green: rand::random(),
            blue: rand::random(),
        }
    }
}

/// Runs the demo over a real broker connection
pub async fn run_pubsub_demo(thing: Arc<Thing>, settings: &DemoSettings) -> Result<(), ThingError> {
    let runner = thing.clone();
    run_with(thing, settings, async move { runner.connect().await }).await
}

async fn run_with<F>(thing: Arc<Thing>, settings: &DemoSettings, session: F) -> Result<(), ThingError>
where
    F: Future<Output = Result<(), ThingError>>,
{
    let logger = spawn_inbound_logger(&thing)?;
    let publisher = spawn_publisher(thing.clone(), settings.clone());

    let result = session.await;
    match &result {
        Ok(()) => info!("Demo session for {} ended", thing.identity()),
        Err(e) => error!("Demo session for {} ended with error: {}", thing.identity(), e),
    }

    // The publisher only outlives the session if it never got to stop it.
    publisher.abort();
    if let Err(e) = logger.await {
        warn!("Inbound logger failed: {}", e);
    }
    result
}

fn spawn_inbound_logger(thing: &Thing) -> Result<JoinHandle<()>, ThingError> {
    let mut inbound = thing.inbound()?;

    Ok(tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            info!("{}", msg);
        }
    }))
}

fn spawn_publisher(thing: Arc<Thing>, settings: DemoSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut publisher = thing.outbound();
        if !publisher.wait_running().await {
            warn!("Thing {} never reached running state", thing.identity());
            return;
        }

        let deadline = tokio::time::sleep(Duration::from_secs(settings.stop_after_secs));
        tokio::pin!(deadline);

        tokio::select! {
            _ = &mut deadline => {}
            result = publish_colors(&publisher, Duration::from_secs(settings.publish_interval_secs)) => {
                if let Err(e) = result {
                    warn!("Publishing stopped: {}", e);
                    return;
                }
            }
        }

        info!("Stopping {}", thing.identity());
        if let Err(e) = thing.stop().await {
            warn!("Stop failed: {}", e);
        }
    })
}

async fn publish_colors(publisher: &ShadowPublisher, interval: Duration) -> Result<(), ThingError> {
    publisher.send_state(&Color::DEMO).await?;
    info!("Reported {:?}", Color::DEMO);

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let color = Color::random();
        publisher.send_state(&color).await?;
        info!("Reported {:?}", color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thing::credential::{fixtures, Credential};
    use crate::thing::link::mock::{Failures, MockLink};
    use crate::thing::link::LinkEvent;
    use crate::thing::{Identity, InboundMessage, ThingConfig, ThingState};
    use serde_json::{json, Value};

    fn thing() -> Arc<Thing> {
        let identity = Identity::new("sprk-1", "us-east-2").unwrap();
        let credential = Credential::new(fixtures::EC_KEY, fixtures::EC_CERT);
        Arc::new(Thing::new(ThingConfig::new(identity, credential)).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn reports_demo_colour_first_and_stops() {
        let thing = thing();
        let (link, record, events) = MockLink::new(Failures::default());
        events
            .send(LinkEvent::Delivery(InboundMessage::from_topic(
                "$aws/things/sprk-1/shadow/update/accepted",
                b"{}".to_vec(),
            )))
            .unwrap();

        let runner = thing.clone();
        let settings = DemoSettings {
            publish_interval_secs: 1,
            stop_after_secs: 3,
        };
        run_with(thing.clone(), &settings, async move {
            runner.connect_over(Box::new(link)).await
        })
        .await
        .unwrap();

        assert_eq!(thing.current_state(), ThingState::Stopped);

        let record = record.lock().unwrap();
        assert!(record.closed);
        assert!(record.published.len() >= 2);
        let first: Value = serde_json::from_slice(&record.published[0].1).unwrap();
        assert_eq!(
            first,
            json!({"state": {"reported": {"red": 187, "green": 114, "blue": 222}}})
        );
        assert!(record
            .published
            .iter()
            .all(|(topic, _)| topic == "$aws/things/sprk-1/shadow/update"));
    }

    #[tokio::test]
    async fn connection_failure_is_reported() {
        let thing = thing();
        let (link, _record, _events) = MockLink::new(Failures {
            open: true,
            ..Failures::default()
        });

        let runner = thing.clone();
        let result = run_with(thing.clone(), &DemoSettings::default(), async move {
            runner.connect_over(Box::new(link)).await
        })
        .await;

        assert!(matches!(result, Err(ThingError::Connection(_))));
        assert_eq!(thing.current_state(), ThingState::Failed);
    }
}
