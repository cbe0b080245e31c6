//! Collection modules and their registration table.
//!
//! The set of drivers is closed: `ModuleRegistry::builtin()` maps each device type to
//! the modules it accepts, and each module id to a constructor. Nothing is discovered
//! at runtime.

pub mod http;
pub mod reachability;

use crate::config::ConfigError;
use crate::data::ModuleData;
use crate::models::{DeviceDescriptor, ModuleAssignment};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Erreurs d'une collecte, isolées au module et au cycle
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Paramètres de connexion passés à un module lors de sa construction
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub module_id: String,
    pub address: String,
    pub timeout: Duration,
    /// Configuration du module, valeurs par défaut du schéma déjà appliquées
    pub config: Map<String, Value>,
}

impl ModuleContext {
    /// Budget des I/O internes, un peu sous le timeout appliqué par le worker
    pub fn io_timeout(&self) -> Duration {
        self.timeout.mul_f64(0.9)
    }

    pub fn setting_str(&self, name: &str) -> Result<&str, ConfigError> {
        match self.config.get(name) {
            Some(Value::String(value)) => Ok(value),
            Some(_) => Err(self.invalid(name)),
            None => Err(ConfigError::MissingSetting {
                module: self.module_id.clone(),
                setting: name.to_string(),
            }),
        }
    }

    pub fn setting_u64(&self, name: &str) -> Result<u64, ConfigError> {
        match self.config.get(name) {
            Some(value) => value.as_u64().ok_or_else(|| self.invalid(name)),
            None => Err(ConfigError::MissingSetting {
                module: self.module_id.clone(),
                setting: name.to_string(),
            }),
        }
    }

    pub fn setting_bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self.config.get(name) {
            Some(value) => value.as_bool().ok_or_else(|| self.invalid(name)),
            None => Err(ConfigError::MissingSetting {
                module: self.module_id.clone(),
                setting: name.to_string(),
            }),
        }
    }

    pub fn invalid(&self, name: &str) -> ConfigError {
        ConfigError::InvalidSetting {
            module: self.module_id.clone(),
            setting: name.to_string(),
        }
    }
}

/// Unité de collecte : un appel = un cycle de mesure pour un équipement
#[async_trait]
pub trait CollectionModule: Send {
    fn id(&self) -> &str;

    async fn collect(&mut self) -> Result<ModuleData, CollectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    String,
    Integer,
    Boolean,
    Password,
}

/// Réglage nommé déclaré par un module. Sans valeur par défaut il est obligatoire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingItem {
    pub kind: SettingKind,
    pub name: String,
    pub label: String,
    pub default: Option<Value>,
    /// Valeurs acceptées pour un réglage texte, vide = libre
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl SettingItem {
    fn accepts(&self, value: &Value) -> bool {
        match value {
            Value::String(s) if !self.choices.is_empty() => self.choices.iter().any(|c| c == s),
            Value::Number(n) => match (n.as_u64(), self.max) {
                (Some(n), Some(max)) => n <= max,
                _ => true,
            },
            _ => true,
        }
    }
}

/// Schéma de configuration d'un module, exposé aux outils de configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleSchema {
    pub default_timeout: Option<u64>,
    pub items: Vec<SettingItem>,
}

impl ModuleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout = Some(secs);
        self
    }

    pub fn item(
        mut self,
        kind: SettingKind,
        name: &str,
        label: &str,
        default: Option<Value>,
    ) -> Self {
        self.items.push(SettingItem {
            kind,
            name: name.to_string(),
            label: label.to_string(),
            default,
            choices: Vec::new(),
            max: None,
        });
        self
    }

    /// Restreint le dernier réglage déclaré à une liste de valeurs
    pub fn one_of(mut self, choices: &[&str]) -> Self {
        if let Some(item) = self.items.last_mut() {
            item.choices = choices.iter().map(|c| c.to_string()).collect();
        }
        self
    }

    /// Borne supérieure du dernier réglage entier déclaré
    pub fn at_most(mut self, max: u64) -> Self {
        if let Some(item) = self.items.last_mut() {
            item.max = Some(max);
        }
        self
    }

    /// Complète `config` avec les défauts et vérifie les types déclarés
    pub fn apply(
        &self,
        module: &str,
        config: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ConfigError> {
        let mut resolved = config.clone();

        for item in &self.items {
            let value = match resolved.get(&item.name) {
                Some(Value::Null) | None => match &item.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(ConfigError::MissingSetting {
                            module: module.to_string(),
                            setting: item.name.clone(),
                        })
                    }
                },
                Some(value) => value.clone(),
            };

            let value = coerce(item.kind, value)
                .filter(|value| item.accepts(value))
                .ok_or_else(|| ConfigError::InvalidSetting {
                    module: module.to_string(),
                    setting: item.name.clone(),
                })?;
            resolved.insert(item.name.clone(), value);
        }

        Ok(resolved)
    }
}

// Les registres envoient souvent des nombres sous forme de texte
fn coerce(kind: SettingKind, value: Value) -> Option<Value> {
    match (kind, value) {
        (SettingKind::String | SettingKind::Password, Value::String(s)) => Some(Value::String(s)),
        (SettingKind::Integer, Value::Number(n)) if n.is_u64() => Some(Value::Number(n)),
        (SettingKind::Integer, Value::String(s)) => s.trim().parse::<u64>().ok().map(Value::from),
        (SettingKind::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
        (SettingKind::Boolean, Value::String(s)) => s.trim().parse::<bool>().ok().map(Value::Bool),
        _ => None,
    }
}

pub type ModuleConstructor =
    Arc<dyn Fn(ModuleContext) -> Result<Box<dyn CollectionModule>, ConfigError> + Send + Sync>;

/// Entrée de la table d'enregistrement : id -> (schéma, constructeur)
#[derive(Clone)]
pub struct ModuleFactory {
    pub id: String,
    pub schema: ModuleSchema,
    build: ModuleConstructor,
}

impl ModuleFactory {
    pub fn new<F>(id: &str, schema: ModuleSchema, build: F) -> Self
    where
        F: Fn(ModuleContext) -> Result<Box<dyn CollectionModule>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.to_string(),
            schema,
            build: Arc::new(build),
        }
    }
}

/// Annonce d'un module connu au backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownModule {
    pub id: String,
    pub device_types: Vec<String>,
    pub schema: ModuleSchema,
}

/// Table type d'équipement -> modules acceptés, résolue au démarrage
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    drivers: BTreeMap<String, BTreeMap<String, ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pilotes fournis avec le poller
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for device_type in ["switch", "access_point"] {
            registry
                .register(device_type, reachability::factory())
                .register(device_type, http::status_factory());
        }
        registry
            .register("controller", reachability::factory())
            .register("controller", http::status_factory())
            .register("controller", http::json_factory());
        registry
    }

    pub fn register(&mut self, device_type: &str, factory: ModuleFactory) -> &mut Self {
        self.drivers
            .entry(device_type.to_string())
            .or_default()
            .insert(factory.id.clone(), factory);
        self
    }

    pub fn device_types(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// Liste des modules connus, un par id, avec les types qui l'acceptent
    pub fn known_modules(&self) -> Vec<KnownModule> {
        let mut known: BTreeMap<String, KnownModule> = BTreeMap::new();
        for (device_type, modules) in &self.drivers {
            for (id, factory) in modules {
                known
                    .entry(id.clone())
                    .or_insert_with(|| KnownModule {
                        id: id.clone(),
                        device_types: Vec::new(),
                        schema: factory.schema.clone(),
                    })
                    .device_types
                    .push(device_type.clone());
            }
        }
        known.into_values().collect()
    }

    fn factory(&self, device_type: &str, module: &str) -> Result<&ModuleFactory, ConfigError> {
        let driver = self
            .drivers
            .get(device_type)
            .ok_or_else(|| ConfigError::UnknownDeviceType(device_type.to_string()))?;
        driver.get(module).ok_or_else(|| ConfigError::UnknownModule {
            device_type: device_type.to_string(),
            module: module.to_string(),
        })
    }

    /// Vérifie qu'un descripteur est démarrable tel quel
    pub fn validate(&self, descriptor: &DeviceDescriptor) -> Result<(), ConfigError> {
        if !self.drivers.contains_key(&descriptor.device_type) {
            return Err(ConfigError::UnknownDeviceType(descriptor.device_type.clone()));
        }
        if descriptor.timeout == 0 {
            return Err(ConfigError::InvalidTimeout(descriptor.id.clone()));
        }
        if descriptor.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress(descriptor.id.clone()));
        }
        for assignment in &descriptor.modules {
            let factory = self.factory(&descriptor.device_type, &assignment.id)?;
            factory.schema.apply(&assignment.id, &assignment.config)?;
        }
        Ok(())
    }

    /// Construit un module ; l'appelant a normalement déjà validé le descripteur
    pub fn build(
        &self,
        device_type: &str,
        address: &str,
        timeout: Duration,
        assignment: &ModuleAssignment,
    ) -> Result<Box<dyn CollectionModule>, ConfigError> {
        let factory = self.factory(device_type, &assignment.id)?;
        let config = factory.schema.apply(&assignment.id, &assignment.config)?;
        (factory.build)(ModuleContext {
            module_id: assignment.id.clone(),
            address: address.to_string(),
            timeout,
            config,
        })
    }

    /// Construit tous les modules d'un équipement, ceux en erreur sont écartés
    pub fn instantiate(
        &self,
        device_id: &str,
        device_type: &str,
        address: &str,
        timeout: Duration,
        assignments: &[ModuleAssignment],
    ) -> Vec<Box<dyn CollectionModule>> {
        assignments
            .iter()
            .filter_map(|assignment| match self.build(device_type, address, timeout, assignment) {
                Ok(module) => Some(module),
                Err(e) => {
                    error!(device = %device_id, module = %assignment.id, "module skipped: {e}");
                    None
                }
            })
            .collect()
    }
}
