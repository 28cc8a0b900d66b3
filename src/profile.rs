use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Opaque identifier of a browser profile (Chrome's profile directory name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProfileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ProfileId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A launchable browser profile as reported by the native host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub directory: ProfileId,
    pub name: String,
    /// Account identifier, only used to detect the profile we run inside.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaia_id: Option<String>,
}

impl Profile {
    pub fn new(directory: impl Into<ProfileId>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            gaia_id: None,
        }
    }

    pub fn with_gaia_id(mut self, gaia_id: impl Into<String>) -> Self {
        self.gaia_id = Some(gaia_id.into());
        self
    }
}
