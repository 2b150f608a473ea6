//! Command line and configuration file
//!
//! Values come from an optional TOML file and the command line; flags win.
//!
//! ```toml
//! [thing]
//! name = "sprk-1"
//! region = "us-east-2"
//! private_key = "/etc/sprk-iot/sprk-1.private.key"
//! certificate = "/etc/sprk-iot/sprk-1.cert.pem"
//!
//! [thing.settings]
//! keep_alive_secs = 30
//!
//! [demo]
//! publish_interval_secs = 1
//! stop_after_secs = 5
//!
//! [drive]
//! speed = 40
//! ```

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::demo::DemoSettings;
use crate::robot::keyboard::DRIVE_SPEED;
use crate::thing::{Credential, Identity, ThingConfig, ThingError, ThingSettings};

const CONFIG_DIR: &str = "sprk-iot";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_REGION: &str = "us-east-2";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value required by the command was neither given as flag nor in the file
    #[error("Missing required value: {0}")]
    Missing(&'static str),

    /// Config or PEM file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this program
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Identity or credential were rejected
    #[error(transparent)]
    Thing(#[from] ThingError),
}

#[derive(Parser, Debug)]
#[command(name = "sprk-iot", version, about = "SPRK+ robot driver and AWS IoT shadow demo")]
pub struct Cli {
    /// TOML configuration file [default: <config dir>/sprk-iot/config.toml]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive a simulated SPRK+ with the arrow keys while its colour cycles
    Drive(DriveArgs),

    /// Publish colour state to the thing's device shadow and log shadow traffic
    IotDemo(IotDemoArgs),
}

#[derive(Args, Debug, Default)]
pub struct DriveArgs {
    /// Roll speed for the arrow keys
    #[arg(long)]
    pub speed: Option<u8>,
}

#[derive(Args, Debug, Default)]
pub struct IotDemoArgs {
    /// Private key of the thing, PEM text or path to a PEM file
    #[arg(long)]
    pub iot_privkey: Option<String>,

    /// Certificate of the thing, PEM text or path to a PEM file
    #[arg(long)]
    pub iot_cert: Option<String>,

    /// Name the thing is registered under
    #[arg(long)]
    pub iot_thingname: Option<String>,

    /// AWS region of the IoT endpoint [default: us-east-2]
    #[arg(long)]
    pub iot_region: Option<String>,

    /// Additional CA certificate to trust, PEM text or path
    #[arg(long)]
    pub iot_ca: Option<String>,

    /// Seconds between colour reports
    #[arg(long)]
    pub publish_interval_secs: Option<u64>,

    /// Seconds after which the demo stops the thing
    #[arg(long)]
    pub stop_after_secs: Option<u64>,
}

/// `[thing]` table
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ThingFileConfig {
    pub name: Option<String>,
    pub region: Option<String>,
    pub private_key: Option<String>,
    pub certificate: Option<String>,
    pub ca_certificate: Option<String>,
    pub settings: ThingSettings,
}

/// `[drive]` table
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DriveFileConfig {
    pub speed: Option<u8>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct FileConfig {
    pub thing: ThingFileConfig,
    pub demo: DemoSettings,
    pub drive: DriveFileConfig,
}

impl FileConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads the explicit file, else the default file if it exists, else defaults
    pub async fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path).await;
        }

        let Some(path) = default_path() else {
            warn!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };

        match tokio::fs::try_exists(&path).await {
            Ok(true) => Self::load(&path).await,
            Ok(false) => {
                debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut path| {
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    })
}

/// Reads `value` from disk if it names a file, otherwise takes it as PEM text
pub async fn resolve_pem(value: &str) -> Result<Vec<u8>, ConfigError> {
    let path = Path::new(value);
    if tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        debug!("Reading PEM from {}", path.display());
        return tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
    }
    Ok(value.as_bytes().to_vec())
}

impl DriveArgs {
    pub fn speed(&self, file: &FileConfig) -> u8 {
        self.speed.or(file.drive.speed).unwrap_or(DRIVE_SPEED)
    }
}

impl IotDemoArgs {
    /// Merges flags over the file into a thing configuration and demo timing
    pub async fn resolve(self, file: FileConfig) -> Result<(ThingConfig, DemoSettings), ConfigError> {
        let FileConfig { thing, demo, .. } = file;

        let name = self
            .iot_thingname
            .or(thing.name)
            .ok_or(ConfigError::Missing("iot-thingname"))?;
        let region = self
            .iot_region
            .or(thing.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let private_key = self
            .iot_privkey
            .or(thing.private_key)
            .ok_or(ConfigError::Missing("iot-privkey"))?;
        let certificate = self
            .iot_cert
            .or(thing.certificate)
            .ok_or(ConfigError::Missing("iot-cert"))?;

        let identity = Identity::new(name, region)?;
        let mut credential =
            Credential::new(resolve_pem(&private_key).await?, resolve_pem(&certificate).await?);
        if let Some(ca) = self.iot_ca.or(thing.ca_certificate) {
            credential = credential.with_ca_certificate(resolve_pem(&ca).await?);
        }

        let demo = DemoSettings {
            publish_interval_secs: self
                .publish_interval_secs
                .unwrap_or(demo.publish_interval_secs),
            stop_after_secs: self.stop_after_secs.unwrap_or(demo.stop_after_secs),
        };

        Ok((
            ThingConfig::new(identity, credential).with_settings(thing.settings),
            demo,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thing::credential::fixtures;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_demo_flags() {
        let cli = Cli::parse_from([
            "sprk-iot",
            "iot-demo",
            "--iot-privkey",
            "key.pem",
            "--iot-cert",
            "cert.pem",
            "--iot-thingname",
            "sprk-1",
        ]);

        match cli.command {
            Command::IotDemo(args) => {
                assert_eq!(args.iot_thingname.as_deref(), Some("sprk-1"));
                assert_eq!(args.iot_privkey.as_deref(), Some("key.pem"));
                assert!(args.iot_region.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["sprk-iot", "drive", "--speed", "60", "--config", "/tmp/x.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        match cli.command {
            Command::Drive(args) => assert_eq!(args.speed(&FileConfig::default()), 60),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn flags_override_file_values() {
        let key = write_file(fixtures::RSA_KEY);
        let cert = write_file(fixtures::RSA_CERT);
        let file = write_file(&format!(
            r#"
[thing]
name = "from-file"
region = "eu-west-1"
private_key = "{}"
certificate = "{}"

[thing.settings]
keep_alive_secs = 60

[demo]
stop_after_secs = 30
"#,
            key.path().display(),
            cert.path().display()
        ));

        let config = FileConfig::load(file.path()).await.unwrap();
        let args = IotDemoArgs {
            iot_thingname: Some("sprk-1".to_string()),
            publish_interval_secs: Some(2),
            ..IotDemoArgs::default()
        };
        let (thing, demo) = args.resolve(config).await.unwrap();

        assert_eq!(thing.identity.name(), "sprk-1");
        assert_eq!(thing.identity.region(), "eu-west-1");
        assert_eq!(thing.settings.keep_alive_secs, 60);
        assert_eq!(thing.settings.inbound_buffer, 100);
        assert_eq!(
            demo,
            DemoSettings {
                publish_interval_secs: 2,
                stop_after_secs: 30
            }
        );
        assert!(thing.credential.client_config().is_ok());
    }

    #[tokio::test]
    async fn region_defaults_and_pem_text_is_accepted() {
        let args = IotDemoArgs {
            iot_thingname: Some("sprk-1".to_string()),
            iot_privkey: Some(fixtures::EC_KEY.to_string()),
            iot_cert: Some(fixtures::EC_CERT.to_string()),
            ..IotDemoArgs::default()
        };
        let (thing, demo) = args.resolve(FileConfig::default()).await.unwrap();

        assert_eq!(thing.identity.region(), "us-east-2");
        assert_eq!(demo, DemoSettings::default());
        assert!(thing.credential.client_config().is_ok());
    }

    #[tokio::test]
    async fn missing_values_are_named() {
        let args = IotDemoArgs {
            iot_thingname: Some("sprk-1".to_string()),
            iot_privkey: Some(fixtures::EC_KEY.to_string()),
            ..IotDemoArgs::default()
        };
        assert!(matches!(
            args.resolve(FileConfig::default()).await,
            Err(ConfigError::Missing("iot-cert"))
        ));
    }

    #[tokio::test]
    async fn invalid_thing_name_is_rejected() {
        let args = IotDemoArgs {
            iot_thingname: Some("sprk/1".to_string()),
            iot_privkey: Some(fixtures::EC_KEY.to_string()),
            iot_cert: Some(fixtures::EC_CERT.to_string()),
            ..IotDemoArgs::default()
        };
        assert!(matches!(
            args.resolve(FileConfig::default()).await,
            Err(ConfigError::Thing(ThingError::InvalidIdentity(_)))
        ));
    }

    #[tokio::test]
    async fn reports_malformed_file() {
        let file = write_file("[thing\nname = ");
        assert!(matches!(
            FileConfig::load(file.path()).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            FileConfig::discover(Some(&missing)).await,
            Err(ConfigError::Read { .. })
        ));
    }
}
