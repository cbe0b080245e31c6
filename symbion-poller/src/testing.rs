/*!
Collaborateurs en mémoire pour les tests

MockDelivery enregistre tout ce qui est publié, StaticSource sert une liste de
descripteurs modifiable, et le pilote `scripted` rejoue des résultats programmés.
*/

use crate::config::ConfigError;
use crate::data::ModuleData;
use crate::delivery::{Delivery, DeliveryError, Topic};
use crate::models::{Batch, DeviceDescriptor, ModuleAssignment};
use crate::modules::{
    CollectError, CollectionModule, KnownModule, ModuleFactory, ModuleRegistry, ModuleSchema,
    SettingKind,
};
use crate::source::{DescriptorSource, SourceError};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SCRIPTED: &str = "scripted";

/// Delivery qui garde les messages au lieu de les publier
#[derive(Clone, Default)]
pub struct MockDelivery {
    published: Shared<Vec<Topic>>,
    versions: Shared<Vec<String>>,
    modules: Shared<Vec<Vec<KnownModule>>>,
    batches: Shared<Vec<Batch>>,
    failing: Arc<AtomicBool>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Topic> {
        self.published.lock().clone()
    }

    pub fn versions(&self) -> Vec<String> {
        self.versions.lock().clone()
    }

    pub fn modules(&self) -> Vec<Vec<KnownModule>> {
        self.modules.lock().clone()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    fn record(&self, topic: Topic) -> Result<(), DeliveryError> {
        self.published.lock().push(topic);
        if self.failing.load(Ordering::SeqCst) {
            // erreur réelle du client, sans broker
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(DeliveryError::Serialize(err));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn announce_version(&self, version: &str) -> Result<(), DeliveryError> {
        self.record(Topic::Version)?;
        self.versions.lock().push(version.to_string());
        Ok(())
    }

    async fn announce_modules(&self, modules: &[KnownModule]) -> Result<(), DeliveryError> {
        self.record(Topic::Modules)?;
        self.modules.lock().push(modules.to_vec());
        Ok(())
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        self.record(Topic::Data)?;
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Source de descripteurs pilotée par le test
#[derive(Clone)]
pub struct StaticSource {
    descriptors: Shared<Vec<DeviceDescriptor>>,
    failing: Arc<AtomicBool>,
}

impl StaticSource {
    pub fn new(descriptors: Vec<DeviceDescriptor>) -> Self {
        Self {
            descriptors: new_state(descriptors),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self, descriptors: Vec<DeviceDescriptor>) {
        *self.descriptors.lock() = descriptors;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DescriptorSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<DeviceDescriptor>, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Parse("registry unavailable".into()));
        }
        Ok(self.descriptors.lock().clone())
    }
}

/// Comportement programmé pour un appel de module
pub enum Step {
    Data(ModuleData),
    Fail,
    Panic,
    Hang,
}

/// Scénario partagé par les modules du pilote `scripted`, indexé par "adresse/module"
#[derive(Clone, Default)]
pub struct Script {
    steps: Shared<HashMap<String, VecDeque<Step>>>,
    calls: Shared<HashMap<String, usize>>,
    builds: Shared<HashMap<String, usize>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, address: &str, module: &str, step: Step) -> &Self {
        self.steps
            .lock()
            .entry(format!("{address}/{module}"))
            .or_default()
            .push_back(step);
        self
    }

    pub fn calls(&self, address: &str, module: &str) -> usize {
        self.calls.lock().get(&format!("{address}/{module}")).copied().unwrap_or(0)
    }

    pub fn builds(&self, address: &str, module: &str) -> usize {
        self.builds.lock().get(&format!("{address}/{module}")).copied().unwrap_or(0)
    }

    /// Registre contenant le type `scripted` avec les modules `alpha` et `beta`
    /// (`beta` exige le réglage `token`)
    pub fn registry(&self) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .register(SCRIPTED, self.factory("alpha", ModuleSchema::new()))
            .register(
                SCRIPTED,
                self.factory(
                    "beta",
                    ModuleSchema::new().item(SettingKind::Password, "token", "API token", None),
                ),
            );
        registry
    }

    fn factory(&self, id: &'static str, schema: ModuleSchema) -> ModuleFactory {
        let script = self.clone();
        ModuleFactory::new(id, schema, move |ctx| {
            let key = format!("{}/{}", ctx.address, id);
            *script.builds.lock().entry(key.clone()).or_default() += 1;
            Ok::<Box<dyn CollectionModule>, ConfigError>(Box::new(ScriptedModule {
                id,
                key,
                script: script.clone(),
            }))
        })
    }
}

struct ScriptedModule {
    id: &'static str,
    key: String,
    script: Script,
}

#[async_trait]
impl CollectionModule for ScriptedModule {
    fn id(&self) -> &str {
        self.id
    }

    async fn collect(&mut self) -> Result<ModuleData, CollectError> {
        let call = {
            let mut calls = self.script.calls.lock();
            let count = calls.entry(self.key.clone()).or_default();
            *count += 1;
            *count
        };
        let step = self
            .script
            .steps
            .lock()
            .get_mut(&self.key)
            .and_then(|steps| steps.pop_front());

        match step {
            Some(Step::Data(data)) => Ok(data),
            Some(Step::Fail) => Err(CollectError::Protocol("scripted failure".into())),
            Some(Step::Panic) => panic!("scripted panic in {}", self.key),
            Some(Step::Hang) => std::future::pending::<Result<ModuleData, CollectError>>().await,
            None => Ok(ModuleData::new().with_static(self.id, json!({ "call": call }))),
        }
    }
}

/// Descripteur du type `scripted`, adresse `{id}.test`, timeout 1 s
pub fn descriptor(id: &str, modules: &[&str]) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        name: format!("device-{id}"),
        device_type: SCRIPTED.to_string(),
        address: format!("{id}.test"),
        timeout: 1,
        modules: modules.iter().map(|m| ModuleAssignment::new(*m)).collect(),
    }
}

/// Attend qu'une condition devienne vraie, `false` si le délai expire
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
