//! Identifiers shared by every crate. Records refer to each other only by id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable device identifier, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphenated lowercase form, as stored in the database.
    pub fn as_text(&self) -> String {
        self.0.to_string()
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Owner of one or more devices. Issued by the account system.
    UserId
);

string_id!(
    /// Conversation identifier. Issued by the conversation system.
    ConversationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_text_form_parses_back() {
        let id = DeviceId::new();
        let parsed: DeviceId = id.as_text().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<DeviceId>().is_err());
    }

    #[test]
    fn ids_serialise_as_bare_strings() {
        let user = UserId::from("alice");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"alice\"");
        let id = DeviceId::new();
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{id}\""));
    }
}
