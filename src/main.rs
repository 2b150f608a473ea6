pub mod config;
pub mod demo;
pub mod robot;
pub mod thing;

use crate::config::{Cli, Command, DriveArgs, FileConfig, IotDemoArgs};
use crate::robot::{keyboard, Robot, SimulatedSprk};
use crate::thing::Thing;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const COLOR_CYCLE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let file = FileConfig::discover(cli.config.as_deref())
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;

    match cli.command {
        Command::Drive(args) => drive(args, &file).await,
        Command::IotDemo(args) => iot_demo(args, file).await,
    }
}

async fn drive(args: DriveArgs, file: &FileConfig) -> Result<()> {
    let speed = args.speed(file);
    let sprk = Arc::new(SimulatedSprk::new("SPRK-sim"));
    let bot: Arc<dyn Robot> = sprk.clone();
    let cancel = CancellationToken::new();

    let events = tokio::spawn(robot::log_events(bot.clone(), cancel.clone()));
    let colors = tokio::spawn(robot::color_cycle(
        bot.clone(),
        COLOR_CYCLE_INTERVAL,
        cancel.clone(),
    ));

    let result = keyboard::drive(bot, speed, cancel.clone()).await;

    cancel.cancel();
    sprk.power_off();
    match colors.await {
        Ok(Err(e)) => warn!("Colour cycle ended with error: {}", e),
        Err(e) => warn!("Colour cycle task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = events.await {
        warn!("Event logger task failed: {}", e);
    }

    result.map_err(|e| eyre!("Drive loop failed: {}", e))?;
    info!("Drive session ended after {} commands", sprk.commands().len());
    Ok(())
}

async fn iot_demo(args: IotDemoArgs, file: FileConfig) -> Result<()> {
    let (thing_config, demo_settings) = args
        .resolve(file)
        .await
        .map_err(|e| eyre!("Invalid demo configuration: {}", e))?;

    let thing = Arc::new(Thing::new(thing_config).map_err(|e| eyre!("Failed to create thing: {}", e))?);

    demo::run_pubsub_demo(thing, &demo_settings)
        .await
        .map_err(|e| eyre!("IoT demo failed: {}", e))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
