use serde::{Deserialize, Serialize};

use crate::{MediumIndex, ModelError, Result, MAX_REPLICATION_FACTOR};

pub const MAX_MEDIUM_PRIORITY: u8 = 10;
const MAX_MEDIUM_NAME_LENGTH: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medium {
    pub index: MediumIndex,
    pub name: String,
    /// Cache media hold ephemeral copies that never count toward durability.
    pub cache: bool,
    pub transient: bool,
    pub priority: u8,
    pub max_replication_factor: u8,
    pub disk_families: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediumConfig {
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_max_replication_factor")]
    pub max_replication_factor: u8,
    #[serde(default)]
    pub disk_families: Vec<String>,
}

fn default_max_replication_factor() -> u8 {
    MAX_REPLICATION_FACTOR
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            cache: false,
            transient: false,
            priority: 0,
            max_replication_factor: MAX_REPLICATION_FACTOR,
            disk_families: Vec::new(),
        }
    }
}

impl Medium {
    pub fn new(index: MediumIndex, name: &str, config: MediumConfig) -> Result<Self> {
        validate_medium_name(name)?;
        validate_medium_priority(config.priority)?;
        if config.max_replication_factor == 0 || config.max_replication_factor > MAX_REPLICATION_FACTOR {
            return Err(ModelError::InvalidReplicationFactor(format!(
                "medium {} replication factor cap {} is outside [1, {}]",
                name, config.max_replication_factor, MAX_REPLICATION_FACTOR
            )));
        }

        Ok(Self {
            index,
            name: name.to_string(),
            cache: config.cache,
            transient: config.transient,
            priority: config.priority,
            max_replication_factor: config.max_replication_factor,
            disk_families: config.disk_families,
        })
    }

    /// Whether a disk of the given family may host replicas on this medium.
    pub fn accepts_disk_family(&self, family: &str) -> bool {
        self.disk_families.is_empty() || self.disk_families.iter().any(|f| f == family)
    }
}

pub(crate) fn validate_medium_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ModelError::InvalidMediumName("medium name cannot be empty".to_string()));
    }
    if name.len() > MAX_MEDIUM_NAME_LENGTH {
        return Err(ModelError::InvalidMediumName(format!(
            "medium name is longer than {} characters",
            MAX_MEDIUM_NAME_LENGTH
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ModelError::InvalidMediumName(format!(
            "medium name {:?} contains invalid characters",
            name
        )));
    }
    Ok(())
}

pub(crate) fn validate_medium_priority(priority: u8) -> Result<()> {
    if priority > MAX_MEDIUM_PRIORITY {
        return Err(ModelError::InvalidMediumPriority {
            priority,
            max: MAX_MEDIUM_PRIORITY,
        });
    }
    Ok(())
}
