/**
 * WORKER - Une task de collecte par équipement
 *
 * CYCLE :
 * 1. drapeau running vérifié (arrêt coopératif via watch)
 * 2. modules reconstruits si la révision des réglages a changé
 * 3. tous les modules collectent en parallèle, chacun borné par le timeout de l'équipement
 * 4. chaque résultat est fusionné dans DeviceData dans l'ordre d'arrivée
 * 5. pause de `cycle` ou réveil immédiat si l'arrêt est demandé
 *
 * Une erreur de module ne coûte que sa contribution au cycle. Un panic termine la task,
 * le reconciler le voit au passage suivant et remplace le worker.
 */

use crate::data::DeviceData;
use crate::models::{DeviceDescriptor, ModuleAssignment};
use crate::modules::{CollectError, CollectionModule, ModuleRegistry};
use crate::state::{new_state, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Réglages modifiables à chaud, la révision signale un changement au worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub timeout: Duration,
    pub modules: Vec<ModuleAssignment>,
    pub revision: u64,
}

pub struct Worker {
    instance: Uuid,
    descriptor: DeviceDescriptor,
    started_at: OffsetDateTime,
    data: Shared<DeviceData>,
    settings: Shared<WorkerSettings>,
    running: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct WorkerTask {
    id: String,
    name: String,
    device_type: String,
    address: String,
    cycle: Duration,
    registry: Arc<ModuleRegistry>,
    data: Shared<DeviceData>,
    settings: Shared<WorkerSettings>,
}

impl Worker {
    /// Démarre la task de collecte avec un accumulateur vide
    pub fn spawn(
        descriptor: DeviceDescriptor,
        registry: Arc<ModuleRegistry>,
        cycle: Duration,
    ) -> Self {
        let data = new_state(DeviceData::new());
        let settings = new_state(WorkerSettings {
            timeout: descriptor.timeout(),
            modules: descriptor.modules.clone(),
            revision: 0,
        });
        let (running, running_rx) = watch::channel(true);
        let instance = Uuid::new_v4();

        let task = WorkerTask {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            device_type: descriptor.device_type.clone(),
            address: descriptor.address.clone(),
            cycle,
            registry,
            data: data.clone(),
            settings: settings.clone(),
        };
        let handle = tokio::spawn(task.run(running_rx));

        info!(device = %descriptor.id, name = %descriptor.name, %instance, "worker started");

        Self {
            instance,
            descriptor,
            started_at: OffsetDateTime::now_utc(),
            data,
            settings,
            running,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    #[cfg(test)]
    pub fn settings(&self) -> WorkerSettings {
        self.settings.lock().clone()
    }

    /// Vivant tant que la task tourne et que l'arrêt n'a pas été demandé
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished() && *self.running.borrow()
    }

    /// Demande l'arrêt sans attendre le cycle en cours
    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    /// Nom, type et adresse sont fixés à la création du worker
    pub fn matches_connection(&self, descriptor: &DeviceDescriptor) -> bool {
        self.descriptor.name == descriptor.name
            && self.descriptor.device_type == descriptor.device_type
            && self.descriptor.address == descriptor.address
    }

    /// Pousse timeout et modules sans toucher à DeviceData. `true` si quelque chose a changé.
    pub fn update(&mut self, descriptor: &DeviceDescriptor) -> bool {
        let changed = self.descriptor.timeout != descriptor.timeout
            || self.descriptor.modules != descriptor.modules;
        if changed {
            let mut settings = self.settings.lock();
            settings.timeout = descriptor.timeout();
            settings.modules = descriptor.modules.clone();
            settings.revision += 1;
        }
        self.descriptor = descriptor.clone();
        changed
    }

    pub fn data(&self) -> Shared<DeviceData> {
        self.data.clone()
    }

    /// Reprend les données non envoyées d'un worker remplacé
    pub fn absorb(&self, salvaged: DeviceData) {
        self.data.lock().merge(salvaged);
    }

    /// Vide l'accumulateur en une opération
    pub fn drain(&self) -> DeviceData {
        self.data.lock().drain()
    }

    /// Arrête le worker et rend la main sur sa task
    pub fn retire(self) -> JoinHandle<()> {
        self.stop();
        self.handle
    }
}

impl WorkerTask {
    async fn run(self, mut running: watch::Receiver<bool>) {
        let mut revision = None;
        let mut modules: Vec<Box<dyn CollectionModule>> = Vec::new();

        loop {
            if !*running.borrow() {
                break;
            }

            let settings = self.settings.lock().clone();
            if revision != Some(settings.revision) {
                modules = self.registry.instantiate(
                    &self.id,
                    &self.device_type,
                    &self.address,
                    settings.timeout,
                    &settings.modules,
                );
                debug!(
                    device = %self.id,
                    modules = modules.len(),
                    revision = settings.revision,
                    "modules built"
                );
                revision = Some(settings.revision);
            }

            self.poll_cycle(&mut modules, settings.timeout).await;

            tokio::select! {
                _ = tokio::time::sleep(self.cycle) => {}
                changed = running.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(device = %self.id, name = %self.name, "worker stopped");
    }

    async fn poll_cycle(&self, modules: &mut [Box<dyn CollectionModule>], timeout: Duration) {
        let mut pending: FuturesUnordered<_> = modules
            .iter_mut()
            .map(|module| async move {
                let id = module.id().to_string();
                let result = tokio::time::timeout(timeout, module.collect())
                    .await
                    .unwrap_or(Err(CollectError::Timeout(timeout)));
                (id, result)
            })
            .collect();

        while let Some((module, result)) = pending.next().await {
            match result {
                Ok(data) => {
                    self.data.lock().add_module_data(data);
                }
                Err(e) => warn!(device = %self.id, %module, "collect failed: {e}"),
            }
        }
    }
}
