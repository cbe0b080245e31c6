/**
 * DATA MODEL - Agrégation des mesures par équipement
 *
 * RÔLE :
 * Types des résultats de collecte (ModuleData, LiveData, Event) et accumulateur
 * par équipement (DeviceData) que le dispatcher vide à chaque cycle d'envoi.
 *
 * RÈGLES DE FUSION :
 * - static_data : fusion profonde, dernier écrivain gagne par chemin complet
 * - live_data : par métrique puis par timestamp, seul le couple (métrique, ts) est écrasé
 * - events : ajout en fin, jamais dédupliqués
 * - external_events : une valeur par clé (source), fusion profonde comme le statique
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Timestamp unix en secondes
pub type Timestamp = i64;

/// Série temporelle d'une métrique : timestamp -> valeur
pub type LiveSeries = BTreeMap<Timestamp, Value>;

/// Toutes les séries d'un équipement : clé de métrique -> série
pub type LiveDataMap = BTreeMap<String, LiveSeries>;

pub fn now_unix() -> Timestamp {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Classification de sortie d'un module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Les événements sont ajoutés à la liste ordonnée
    #[default]
    Default,
    /// Les événements remplacent la valeur précédente de leur source
    External,
}

/// Un échantillon horodaté d'une série nommée
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub name: String,
    pub timestamp: Timestamp,
    pub value: Value,
    /// Chemin pointé optionnel (ex: "interfaces.eth0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl LiveData {
    pub fn new(name: impl Into<String>, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value: value.into(),
            path: None,
        }
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Clé de la série dans `DeviceData::live_data`
    pub fn key(&self) -> String {
        match &self.path {
            Some(path) if !path.is_empty() => format!("{}.{}", path, self.name),
            _ => self.name.clone(),
        }
    }
}

/// Occurrence discrète remontée par un module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Source de l'événement, sert de clé en sortie External
    pub source: String,
    pub timestamp: Timestamp,
    pub payload: Value,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            timestamp: now_unix(),
            payload,
        }
    }
}

/// Élément de la séquence ordonnée d'un ModuleData
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Live(LiveData),
    Event(Event),
}

impl From<LiveData> for Sample {
    fn from(value: LiveData) -> Self {
        Sample::Live(value)
    }
}

impl From<Event> for Sample {
    fn from(value: Event) -> Self {
        Sample::Event(value)
    }
}

/// Résultat d'une invocation de module. Construit une fois, consommé une fois.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleData {
    static_data: Map<String, Value>,
    samples: Vec<Sample>,
    output: OutputKind,
}

impl ModuleData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static(mut self, key: impl Into<String>, value: Value) -> Self {
        deep_merge_entry(&mut self.static_data, key.into(), value);
        self
    }

    pub fn push(mut self, sample: impl Into<Sample>) -> Self {
        self.samples.push(sample.into());
        self
    }

    pub fn external(mut self) -> Self {
        self.output = OutputKind::External;
        self
    }

    #[cfg(test)]
    pub fn static_data(&self) -> &Map<String, Value> {
        &self.static_data
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    #[cfg(test)]
    pub fn output(&self) -> OutputKind {
        self.output
    }
}

/// Fusion profonde de `incoming` dans `target`.
///
/// Deux objets à la même clé sont fusionnés récursivement ; toute autre valeur
/// entrante écrase l'existante.
pub fn deep_merge(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        deep_merge_entry(target, key, value);
    }
}

fn deep_merge_entry(target: &mut Map<String, Value>, key: String, value: Value) {
    if let Value::Object(nested) = value {
        if let Some(Value::Object(existing)) = target.get_mut(&key) {
            deep_merge(existing, nested);
            return;
        }
        target.insert(key, Value::Object(nested));
    } else {
        target.insert(key, value);
    }
}

/// Fusion des séries : seul le couple (métrique, timestamp) est écrasé
pub fn merge_live(target: &mut LiveDataMap, incoming: LiveDataMap) {
    for (metric, series) in incoming {
        target.entry(metric).or_default().extend(series);
    }
}

/// Accumulateur par équipement, vidé par le dispatcher
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceData {
    pub static_data: Map<String, Value>,
    pub live_data: LiveDataMap,
    pub events: Vec<Event>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub external_events: Map<String, Value>,
}

impl DeviceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intègre le résultat d'un module
    pub fn add_module_data(&mut self, data: ModuleData) {
        let ModuleData {
            static_data,
            samples,
            output,
        } = data;

        deep_merge(&mut self.static_data, static_data);

        for sample in samples {
            match sample {
                Sample::Live(live) => {
                    let key = live.key();
                    self.live_data
                        .entry(key)
                        .or_default()
                        .insert(live.timestamp, live.value);
                }
                Sample::Event(event) => match output {
                    OutputKind::Default => self.events.push(event),
                    OutputKind::External => {
                        deep_merge_entry(&mut self.external_events, event.source, event.payload);
                    }
                },
            }
        }
    }

    /// Intègre un autre accumulateur (ex: données d'un worker remplacé)
    pub fn merge(&mut self, other: DeviceData) {
        deep_merge(&mut self.static_data, other.static_data);
        merge_live(&mut self.live_data, other.live_data);
        self.events.extend(other.events);
        deep_merge(&mut self.external_events, other.external_events);
    }

    pub fn is_empty(&self) -> bool {
        self.static_data.is_empty()
            && self.live_data.is_empty()
            && self.events.is_empty()
            && self.external_events.is_empty()
    }

    /// Lit et remet à zéro en une seule opération
    pub fn drain(&mut self) -> DeviceData {
        std::mem::take(self)
    }
}
