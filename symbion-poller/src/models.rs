use crate::data::DeviceData;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    30
}

/// Module assigné à un équipement avec sa configuration propre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAssignment {
    pub id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[cfg(test)]
impl ModuleAssignment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: Map::new(),
        }
    }

    pub fn with_setting(mut self, name: &str, value: Value) -> Self {
        self.config.insert(name.to_string(), value);
        self
    }
}

/// État désiré d'un équipement tel que fourni par le registre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(alias = "ip")]
    pub address: String,
    /// Timeout en secondes
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub modules: Vec<ModuleAssignment>,
}

impl DeviceDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

// Le registre renvoie des ids numériques, on les normalise en String
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

/// Enregistrement livré pour un équipement
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub data: DeviceData,
}

/// Lot envoyé au backend à chaque cycle du dispatcher
#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
    pub devices: Vec<DeviceRecord>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}
