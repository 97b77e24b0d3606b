//! Upstream-to-local user identity mapping.
//!
//! Upstream identifies users by mail address; the cluster knows POSIX
//! accounts. The mapping lives in a small YAML file on the connector
//! host and is loaded once at startup.

use serde::Deserialize;
use tracing::info;

use crate::error::{AdapterError, AdapterResult};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct UserEntry {
    mail: String,
    local_user: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MappingFile {
    users_mapping: Vec<UserEntry>,
}

/// Resolves upstream mail identities to cluster accounts.
#[derive(Debug, Clone, Default)]
pub struct UserMapper {
    entries: Vec<UserEntry>,
}

impl UserMapper {
    /// An empty mapping; every lookup fails.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a mapping document.
    pub fn from_yaml_str(yaml: &str) -> AdapterResult<Self> {
        let file: MappingFile = serde_yaml_ng::from_str(yaml)
            .map_err(|e| AdapterError::Config(format!("users mapping: {e}")))?;
        Ok(Self {
            entries: file.users_mapping,
        })
    }

    /// Load the mapping from a file on the connector host.
    pub fn load(path: &str) -> AdapterResult<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Config(format!("users mapping {path}: {e}")))?;
        let mapper = Self::from_yaml_str(&yaml)?;
        info!("loaded {} user mapping entries from {path}", mapper.entries.len());
        Ok(mapper)
    }

    /// Resolve a mail identity; last entry wins on duplicates.
    pub fn local_user(&self, mail: &str) -> AdapterResult<String> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.mail == mail)
            .map(|e| e.local_user.clone())
            .ok_or_else(|| AdapterError::UnmappedUser(mail.to_string()))
    }
}
