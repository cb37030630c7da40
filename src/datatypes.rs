use std::{collections::BTreeMap, fmt, net::SocketAddr};

use crate::{
    error::{Error, Result},
    uri::CoapUri,
    BINDING_ID, THING_TYPE,
};

/// Body of a `/oic/res` discovery reply
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResourceDirectory {
    pub oic: Vec<ResourceLink>,
}

impl ResourceDirectory {
    pub fn first(&self) -> Result<&ResourceLink> {
        self.oic
            .first()
            .ok_or_else(|| Error::Payload(String::from("empty oic resource list")))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResourceLink {
    pub href: String,
    pub sid: String,
    pub prop: Option<ResourceProperties>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ResourceProperties {
    #[serde(default)]
    pub rt: Vec<String>,
    #[serde(rename = "if", default)]
    pub interfaces: Vec<String>,
    pub obs: Option<u8>,
}

/// Body of a GET on a light resource
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LightPayload {
    pub oic: Vec<LightResource>,
}

impl LightPayload {
    pub fn representation(&self) -> Result<&LightRepresentation> {
        self.oic
            .first()
            .map(|resource| &resource.rep)
            .ok_or_else(|| Error::Payload(String::from("empty oic resource list")))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LightResource {
    pub href: Option<String>,
    pub rep: LightRepresentation,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LightRepresentation {
    pub name: Option<String>,
    pub power: f64,
    pub state: Option<bool>,
}

/// Extract the power value from a light resource payload
pub fn parse_power(payload: &[u8]) -> Result<f64> {
    let light = serde_json::from_slice::<LightPayload>(payload)?;
    Ok(light.representation()?.power)
}

/// A light found on the network
#[derive(Debug, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRecord {
    pub id: String,
    pub uri: String,
}

impl DeviceRecord {
    /// Build a record from a discovery reply sent by `source`
    pub fn from_reply(source: SocketAddr, payload: &[u8]) -> Result<Self> {
        let directory = serde_json::from_slice::<ResourceDirectory>(payload)?;
        let link = directory.first()?;

        let id = link.sid.split('-').next().unwrap_or_default();
        if id.is_empty() {
            return Err(Error::Payload(format!("unusable sid {:?}", link.sid)));
        }
        if link.href.is_empty() {
            return Err(Error::Payload(String::from("empty href")));
        }

        // re-parse so that a record always carries a usable address
        let uri: CoapUri = CoapUri::from_source(source, &link.href).to_string().parse()?;

        Ok(Self {
            id: id.to_string(),
            uri: uri.to_string(),
        })
    }

    pub fn thing_uid(&self) -> String {
        format!("{}:{}:{}", BINDING_ID, THING_TYPE, self.id)
    }

    pub fn label(&self) -> String {
        format!("IoTivity light - {}", self.id)
    }

    /// Properties handed to the hub inbox; `uri` is the representation property
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        let mut properties = BTreeMap::new();
        properties.insert("uri", self.uri.clone());
        properties
    }
}

/// Power value reported on the power channel
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum PowerReading {
    Decimal(f64),
    Undefined,
}

impl PowerReading {
    pub fn value(&self) -> Option<f64> {
        match self {
            PowerReading::Decimal(value) => Some(*value),
            PowerReading::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.value().is_none()
    }
}

impl From<Result<f64>> for PowerReading {
    fn from(result: Result<f64>) -> Self {
        match result {
            Ok(value) => PowerReading::Decimal(value),
            Err(_) => PowerReading::Undefined,
        }
    }
}

impl fmt::Display for PowerReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerReading::Decimal(value) => write!(f, "{}", value),
            PowerReading::Undefined => f.write_str("UNDEF"),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub const DISCOVERY_JSON: &str = r#"{
      "oic": [
        {
          "href": "/a/light",
          "sid": "70eb96a2-2de0-46ec-8a50-83da8ea4ef9d",
          "prop": {
            "rt": ["core.light", "core.brightlight"],
            "if": ["oic.if.baseline", "oic.if.ll"],
            "obs": 1
          }
        }
      ]
    }"#;

    pub const LIGHT_JSON: &str = r#"{
      "oic": [
        {
          "href": "/a/light",
          "rep": {"name": "John's light", "power": 42.5, "state": true}
        }
      ]
    }"#;

    pub const LIGHT_OFF_JSON: &str =
        r#"{"oic":[{"href":"/a/light","rep":{"name":"John's light","power":0.0,"state":false}}]}"#;

    fn source() -> SocketAddr {
        "203.0.113.5:5683".parse().unwrap()
    }

    #[test]
    fn deserialise_discovery_reply() {
        let result = serde_json::from_str::<ResourceDirectory>(DISCOVERY_JSON).unwrap();

        let link = result.first().unwrap();
        assert_eq!(link.href, "/a/light");
        let prop = link.prop.as_ref().unwrap();
        assert_eq!(prop.rt, vec!["core.light", "core.brightlight"]);
        assert_eq!(prop.interfaces, vec!["oic.if.baseline", "oic.if.ll"]);
        assert_eq!(prop.obs, Some(1));
    }

    #[test]
    fn record_from_reply() {
        let record = DeviceRecord::from_reply(source(), DISCOVERY_JSON.as_bytes()).unwrap();

        assert_eq!(
            DeviceRecord {
                id: String::from("70eb96a2"),
                uri: String::from("coap://203.0.113.5:5683/a/light"),
            },
            record
        );
        assert_eq!("iotivity:light:70eb96a2", record.thing_uid());
        assert_eq!("IoTivity light - 70eb96a2", record.label());
        assert_eq!(
            Some(&String::from("coap://203.0.113.5:5683/a/light")),
            record.properties().get("uri")
        );
    }

    #[test]
    fn record_from_reply_without_hyphen() {
        let payload = r#"{"oic":[{"href":"/light/1","sid":"abcdef"}]}"#;
        let record = DeviceRecord::from_reply(source(), payload.as_bytes()).unwrap();

        assert_eq!("abcdef", record.id);
        assert_eq!("coap://203.0.113.5:5683/light/1", record.uri);
    }

    #[test]
    fn record_from_malformed_reply() {
        for payload in &[
            "not json",
            r#"{"oic":[]}"#,
            r#"{"oic":[{"sid":"70eb96a2-2de0"}]}"#,
            r#"{"oic":[{"href":"/a/light"}]}"#,
            r#"{"oic":[{"href":"/a/light","sid":"-2de0"}]}"#,
            r#"{"oic":[{"href":"","sid":"70eb96a2-2de0"}]}"#,
            r#"{"oic":[{"href":"/a light\n#x","sid":"70eb96a2-2de0"}]}"#,
            r#"{"oic":[{"href":"/a/light#top","sid":"70eb96a2-2de0"}]}"#,
        ] {
            assert!(
                DeviceRecord::from_reply(source(), payload.as_bytes()).is_err(),
                "accepted {}",
                payload
            );
        }
    }

    #[test]
    fn power_from_payload() {
        assert_eq!(42.5, parse_power(LIGHT_JSON.as_bytes()).unwrap());
        assert_eq!(0.0, parse_power(LIGHT_OFF_JSON.as_bytes()).unwrap());
    }

    #[test]
    fn power_missing() {
        let payload = r#"{"oic":[{"href":"/a/light","rep":{"name":"x","state":true}}]}"#;
        assert!(parse_power(payload.as_bytes()).is_err());
        assert!(parse_power(br#"{"oic":[]}"#).is_err());
        assert!(parse_power(b"").is_err());
    }

    #[test]
    fn reading_display() {
        assert_eq!("42.5", PowerReading::Decimal(42.5).to_string());
        assert_eq!("UNDEF", PowerReading::Undefined.to_string());
        assert_eq!("null", serde_json::to_string(&PowerReading::Undefined).unwrap());
        assert_eq!("42.5", serde_json::to_string(&PowerReading::Decimal(42.5)).unwrap());
    }
}
