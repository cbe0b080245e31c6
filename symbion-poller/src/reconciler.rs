/**
 * RECONCILER - Convergence des workers vers la liste désirée
 *
 * À chaque passe :
 * - désirés - vivants = à démarrer (descripteur validé avant le spawn)
 * - vivants - désirés = à arrêter (drapeau coupé, task retirée puis récoltée plus tard)
 * - désirés ∩ vivants = mise à jour sur place, ou remplacement si le worker est mort
 *   ou si nom/type/adresse ont changé
 *
 * Le reconciler est le seul écrivain de la map des workers. Un équipement en erreur
 * n'interrompt jamais la passe ; une source indisponible saute la passe entière.
 */

use crate::data::DeviceData;
use crate::models::DeviceDescriptor;
use crate::modules::ModuleRegistry;
use crate::source::{DescriptorSource, SourceError};
use crate::state::{new_rw_state, new_state, Shared, SharedRw};
use crate::worker::Worker;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Vue d'un worker vivant pour les lecteurs (dispatcher)
#[derive(Clone)]
pub struct WorkerView {
    pub id: String,
    pub name: String,
    pub data: Shared<DeviceData>,
}

/// Map des workers vivants + tasks arrêtées en attente de récolte
#[derive(Clone, Default)]
pub struct Fleet {
    workers: SharedRw<HashMap<String, Worker>>,
    retired: Shared<Vec<(String, JoinHandle<()>)>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            workers: new_rw_state(HashMap::new()),
            retired: new_state(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn instance(&self, id: &str) -> Option<uuid::Uuid> {
        self.workers.read().get(id).map(Worker::instance)
    }

    #[cfg(test)]
    pub fn is_alive(&self, id: &str) -> Option<bool> {
        self.workers.read().get(id).map(Worker::is_alive)
    }

    /// Copie des accès aux accumulateurs, le verrou n'est tenu que le temps de la copie
    pub fn snapshot(&self) -> Vec<WorkerView> {
        self.workers
            .read()
            .values()
            .map(|worker| WorkerView {
                id: worker.id().to_string(),
                name: worker.name().to_string(),
                data: worker.data(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, worker: Worker) {
        self.workers.write().insert(worker.id().to_string(), worker);
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    fn retire(&self, worker: Worker) {
        let id = worker.id().to_string();
        let handle = worker.retire();
        self.retired.lock().push((id, handle));
    }

    /// Récolte les tasks retirées déjà terminées et journalise les panics
    pub fn reap(&self) -> usize {
        let finished: Vec<(String, JoinHandle<()>)> = {
            let mut retired = self.retired.lock();
            let (finished, pending): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|(_, handle)| handle.is_finished());
            *retired = pending;
            finished
        };

        let count = finished.len();
        for (id, handle) in finished {
            if let Some(Err(e)) = handle.now_or_never() {
                if e.is_panic() {
                    warn!(device = %id, "retired worker had panicked");
                }
            }
        }
        count
    }

    /// Arrête tous les workers et attend leur fin au plus `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let mut handles: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.write();
            workers
                .drain()
                .map(|(id, worker)| (id, worker.retire()))
                .collect()
        };
        handles.append(&mut self.retired.lock());

        let count = handles.len();
        let join = futures::future::join_all(handles.into_iter().map(|(_, handle)| handle));
        match tokio::time::timeout(grace, join).await {
            Ok(_) => info!("{count} workers stopped"),
            Err(_) => warn!("workers still running after {grace:?}, giving up"),
        }
    }
}

/// Compte rendu d'une passe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub started: usize,
    pub stopped: usize,
    pub updated: usize,
    pub replaced: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    source: Arc<dyn DescriptorSource>,
    registry: Arc<ModuleRegistry>,
    fleet: Fleet,
    cycle: Duration,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        registry: Arc<ModuleRegistry>,
        fleet: Fleet,
        cycle: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            fleet,
            cycle,
        }
    }

    #[cfg(test)]
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Une passe complète : lecture de la source puis application
    pub async fn reconcile_once(&self) -> Result<PassReport, SourceError> {
        let descriptors = match self.source.fetch().await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!("descriptor source failed, skipping pass: {e}");
                return Err(e);
            }
        };

        let mut desired = BTreeMap::new();
        for descriptor in descriptors {
            if let Some(previous) = desired.insert(descriptor.id.clone(), descriptor) {
                warn!(device = %previous.id, "duplicate device id, keeping the last entry");
            }
        }

        let report = self.apply(desired);
        if report != PassReport::default() {
            info!(
                started = report.started,
                stopped = report.stopped,
                updated = report.updated,
                replaced = report.replaced,
                failed = report.failed,
                workers = self.fleet.len(),
                retired = self.fleet.retired_count(),
                "reconcile pass done"
            );
        }
        Ok(report)
    }

    /// Applique l'état désiré à la map des workers
    pub fn apply(&self, desired: BTreeMap<String, DeviceDescriptor>) -> PassReport {
        let mut report = PassReport::default();
        let reaped = self.fleet.reap();
        if reaped > 0 {
            debug!("reaped {reaped} retired workers");
        }

        let mut workers = self.fleet.workers.write();

        let to_stop: Vec<String> = workers
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in to_stop {
            if let Some(worker) = workers.remove(&id) {
                info!(device = %id, name = %worker.name(), "stopping worker");
                self.fleet.retire(worker);
                report.stopped += 1;
            }
        }

        for (id, descriptor) in desired {
            if let Err(e) = self.registry.validate(&descriptor) {
                error!(device = %id, name = %descriptor.name, "invalid device configuration: {e}");
                report.failed += 1;
                if let Some(worker) = workers.remove(&id) {
                    info!(
                        device = %id,
                        name = %worker.name(),
                        "stopping worker with invalid configuration"
                    );
                    self.fleet.retire(worker);
                    report.stopped += 1;
                }
                continue;
            }

            let (replace, seed) = match workers.get_mut(&id) {
                None => (false, None),
                Some(worker) if !worker.is_alive() => {
                    warn!(
                        device = %id,
                        name = %worker.name(),
                        instance = %worker.instance(),
                        started_at = %worker.started_at(),
                        "worker is dead, replacing it"
                    );
                    (true, Some(worker.drain()))
                }
                Some(worker) if !worker.matches_connection(&descriptor) => {
                    info!(
                        device = %id,
                        name = %descriptor.name,
                        "connection parameters changed, replacing worker"
                    );
                    (true, Some(worker.drain()))
                }
                Some(worker) => {
                    if worker.update(&descriptor) {
                        info!(device = %id, name = %descriptor.name, "worker settings updated");
                        report.updated += 1;
                    }
                    continue;
                }
            };

            if replace {
                if let Some(old) = workers.remove(&id) {
                    self.fleet.retire(old);
                }
                report.replaced += 1;
            } else {
                report.started += 1;
            }

            let worker = Worker::spawn(descriptor, self.registry.clone(), self.cycle);
            if let Some(salvaged) = seed {
                worker.absorb(salvaged);
            }
            workers.insert(id, worker);
        }

        report
    }

    /// Boucle périodique, les passes sont strictement séquentielles
    pub async fn run(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            // l'erreur est déjà journalisée
            let _ = self.reconcile_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ModuleData;
    use crate::models::ModuleAssignment;
    use crate::testing::{descriptor, wait_until, Script, StaticSource, Step};
    use serde_json::json;

    const CYCLE: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(3);

    fn reconciler(script: &Script, source: &StaticSource) -> Reconciler {
        Reconciler::new(
            Arc::new(source.clone()),
            Arc::new(script.registry()),
            Fleet::new(),
            CYCLE,
        )
    }

    #[tokio::test]
    async fn test_converges_to_desired_set() {
        let script = Script::new();
        let source = StaticSource::new(vec![
            descriptor("1", &["alpha"]),
            descriptor("2", &["alpha"]),
        ]);
        let reconciler = reconciler(&script, &source);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started, 2);
        assert_eq!(reconciler.fleet().ids(), vec!["1", "2"]);

        source.set(vec![descriptor("2", &["alpha"]), descriptor("3", &["alpha"])]);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.stopped, 1);
        assert_eq!(reconciler.fleet().ids(), vec!["2", "3"]);

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_invalid_devices_are_isolated() {
        let script = Script::new();
        let mut unknown_type = descriptor("2", &["alpha"]);
        unknown_type.device_type = "toaster".into();
        let source = StaticSource::new(vec![
            descriptor("1", &["alpha"]),
            unknown_type,
            descriptor("3", &["beta"]),
        ]);
        let reconciler = reconciler(&script, &source);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(reconciler.fleet().ids(), vec!["1"]);

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_setting_out_of_driver_range_isolates_device() {
        let mut switch = descriptor("9", &[]);
        switch.device_type = "switch".into();
        switch.modules = vec![
            ModuleAssignment::new("reachability").with_setting("port", json!(70000)),
            ModuleAssignment::new("http_status").with_setting("scheme", json!("ftp")),
        ];
        let source = StaticSource::new(vec![switch]);
        let reconciler = Reconciler::new(
            Arc::new(source.clone()),
            Arc::new(ModuleRegistry::builtin()),
            Fleet::new(),
            CYCLE,
        );

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.started, 0);
        assert!(reconciler.fleet().is_empty());

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_invalid_update_stops_worker() {
        let script = Script::new();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();

        source.set(vec![descriptor("1", &["gamma"])]);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stopped, 1);
        assert!(reconciler.fleet().is_empty());

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced_with_salvaged_data() {
        let script = Script::new();
        script
            .push(
                "1.test",
                "alpha",
                Step::Data(ModuleData::new().with_static("before_crash", json!(true))),
            )
            .push("1.test", "alpha", Step::Panic);
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);

        reconciler.reconcile_once().await.unwrap();
        let first = reconciler.fleet().instance("1").unwrap();
        assert!(wait_until(WAIT, || reconciler.fleet().is_alive("1") == Some(false)).await);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_ne!(reconciler.fleet().instance("1").unwrap(), first);
        assert_eq!(reconciler.fleet().len(), 1);

        let views = reconciler.fleet().snapshot();
        assert_eq!(views[0].data.lock().static_data["before_crash"], json!(true));

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_stop_then_restart_keeps_one_worker() {
        let script = Script::new();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();
        let first = reconciler.fleet().instance("1").unwrap();

        source.set(vec![]);
        reconciler.reconcile_once().await.unwrap();
        assert!(reconciler.fleet().is_empty());
        assert_eq!(reconciler.fleet().retired_count(), 1);

        source.set(vec![descriptor("1", &["alpha"])]);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(reconciler.fleet().len(), 1);
        assert_ne!(reconciler.fleet().instance("1").unwrap(), first);

        // l'ancienne task finit et est récoltée à une passe suivante
        assert!(
            wait_until(WAIT, || {
                reconciler.fleet().reap();
                reconciler.fleet().retired_count() == 0
            })
            .await
        );

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_settings_change_updates_in_place() {
        let script = Script::new();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();
        let first = reconciler.fleet().instance("1").unwrap();

        let mut next = descriptor("1", &["alpha"]);
        next.timeout = 2;
        next.modules.push(ModuleAssignment::new("beta").with_setting("token", json!("t")));
        source.set(vec![next]);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(reconciler.fleet().instance("1").unwrap(), first);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report, PassReport::default());

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_address_change_replaces_worker() {
        let script = Script::new();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();
        let first = reconciler.fleet().instance("1").unwrap();

        let mut moved = descriptor("1", &["alpha"]);
        moved.address = "moved.test".into();
        source.set(vec![moved]);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_ne!(reconciler.fleet().instance("1").unwrap(), first);
        assert!(wait_until(WAIT, || script.calls("moved.test", "alpha") >= 1).await);

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_source_failure_leaves_fleet_untouched() {
        let script = Script::new();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"])]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();

        source.set_failing(true);
        assert!(reconciler.reconcile_once().await.is_err());
        assert_eq!(reconciler.fleet().ids(), vec!["1"]);

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_last_entry() {
        let script = Script::new();
        let mut second = descriptor("1", &["alpha"]);
        second.name = "renamed".into();
        let source = StaticSource::new(vec![descriptor("1", &["alpha"]), second]);
        let reconciler = reconciler(&script, &source);

        reconciler.reconcile_once().await.unwrap();
        let views = reconciler.fleet().snapshot();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].name, "renamed");

        reconciler.fleet().shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let script = Script::new();
        let source = StaticSource::new(vec![
            descriptor("1", &["alpha"]),
            descriptor("2", &["alpha"]),
        ]);
        let reconciler = reconciler(&script, &source);
        reconciler.reconcile_once().await.unwrap();
        assert!(wait_until(WAIT, || script.calls("2.test", "alpha") >= 1).await);

        reconciler.fleet().shutdown(WAIT).await;
        assert!(reconciler.fleet().is_empty());
        assert_eq!(reconciler.fleet().retired_count(), 0);

        let calls = script.calls("1.test", "alpha");
        tokio::time::sleep(CYCLE * 5).await;
        assert_eq!(script.calls("1.test", "alpha"), calls);
    }
}
