use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::EventError;

/// The registered event realms.
///
/// Resolved once from strings at the edges (ingestion, registration); an
/// unknown realm is an error there rather than a silent skip later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
    /// Directory objects managed through UDM.
    Udm,
}

impl Realm {
    pub const ALL: [Realm; 1] = [Realm::Udm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Udm => "udm",
        }
    }

    /// Attribute every object of this realm must carry as a string.
    pub fn domain_key(&self) -> &'static str {
        match self {
            Realm::Udm => "dn",
        }
    }

    /// Check that an object can be mapped to this realm's domain type.
    pub fn validate_object(&self, object: &Map<String, Value>) -> Result<(), EventError> {
        match object.get(self.domain_key()) {
            Some(Value::String(key)) if !key.is_empty() => Ok(()),
            _ => Err(EventError::MissingDomainKey {
                realm: self.as_str(),
                key: self.domain_key(),
            }),
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Realm {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udm" => Ok(Realm::Udm),
            other => Err(EventError::UnknownRealm(other.to_string())),
        }
    }
}
