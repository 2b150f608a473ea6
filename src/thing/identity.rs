use std::fmt;

use super::error::ThingError;

/// Topic namespace reserved by AWS IoT for device shadows
pub const SHADOW_NAMESPACE: &str = "$aws";

/// TLS port of the AWS IoT data endpoint
pub const BROKER_PORT: u16 = 8883;

/// Name and region of a registered AWS IoT thing
///
/// Everything the bridge addresses on the broker is derived from these two
/// values: the endpoint host, the client id and the shadow topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    name: String,
    region: String,
}

impl Identity {
    /// Validates and builds an identity
    ///
    /// The name must be a valid AWS IoT thing name (`[a-zA-Z0-9:_-]+`), which
    /// also keeps `/`, `+` and `#` out of the topic level it becomes. The
    /// region becomes part of a host name.
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Result<Self, ThingError> {
        let name = name.into();
        let region = region.into();

        if name.is_empty() {
            return Err(ThingError::InvalidIdentity(
                "thing name must not be empty".to_string(),
            ));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-')))
        {
            return Err(ThingError::InvalidIdentity(format!(
                "thing name '{}' contains '{}', allowed are letters, digits, ':', '_' and '-'",
                name, c
            )));
        }
        if region.is_empty()
            || !region
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ThingError::InvalidIdentity(format!(
                "region '{}' is not a valid AWS region name",
                region
            )));
        }

        Ok(Self { name, region })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Host of the regional AWS IoT data endpoint
    pub fn broker_host(&self) -> String {
        format!("data.iot.{}.amazonaws.com", self.region)
    }

    /// Endpoint in URL form, used for logging
    pub fn broker_url(&self) -> String {
        format!("ssl://{}:{}", self.broker_host(), BROKER_PORT)
    }

    /// Filter matching every shadow topic of this thing
    pub fn shadow_filter(&self) -> String {
        format!("{}/things/{}/shadow/#", SHADOW_NAMESPACE, self.name)
    }

    /// Topic the reported state is published to
    pub fn update_topic(&self) -> String {
        format!("{}/things/{}/shadow/update", SHADOW_NAMESPACE, self.name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_endpoint_and_topics() {
        let identity = Identity::new("sprk-1", "us-east-2").unwrap();

        assert_eq!(identity.broker_host(), "data.iot.us-east-2.amazonaws.com");
        assert_eq!(
            identity.broker_url(),
            "ssl://data.iot.us-east-2.amazonaws.com:8883"
        );
        assert_eq!(identity.shadow_filter(), "$aws/things/sprk-1/shadow/#");
        assert_eq!(identity.update_topic(), "$aws/things/sprk-1/shadow/update");
    }

    #[test]
    fn rejects_empty_name() {
        let err = Identity::new("", "us-east-2").unwrap_err();
        assert!(matches!(err, ThingError::InvalidIdentity(_)));
    }

    #[test]
    fn rejects_characters_outside_thing_name_set() {
        for name in ["a/b", "sprk+", "#", "sprk 1", "sprk.1", "sprk!"] {
            assert!(
                matches!(
                    Identity::new(name, "us-east-2"),
                    Err(ThingError::InvalidIdentity(_))
                ),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn accepts_full_thing_name_set() {
        let identity = Identity::new("Sprk:1_lab-B", "us-east-2").unwrap();
        assert_eq!(identity.update_topic(), "$aws/things/Sprk:1_lab-B/shadow/update");
    }

    #[test]
    fn rejects_malformed_region() {
        assert!(Identity::new("sprk-1", "").is_err());
        assert!(Identity::new("sprk-1", "us east").is_err());
        assert!(Identity::new("sprk-1", "evil.example.com/").is_err());
    }
}
