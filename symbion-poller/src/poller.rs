use crate::config::PollerConfig;
use crate::delivery::Delivery;
use crate::dispatcher::Dispatcher;
use crate::modules::ModuleRegistry;
use crate::reconciler::{Fleet, Reconciler};
use crate::source::DescriptorSource;
use crate::supervisor::{task_entry, Supervisor};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const RECONCILE_TASK: &str = "reconcile";
pub const DISPATCH_TASK: &str = "dispatch";

/// Assemblage : supervisor -> (reconcile, dispatch) -> workers -> delivery
pub struct Poller {
    config: PollerConfig,
    version: String,
    registry: Arc<ModuleRegistry>,
    source: Arc<dyn DescriptorSource>,
    delivery: Arc<dyn Delivery>,
    fleet: Fleet,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        registry: ModuleRegistry,
        source: Arc<dyn DescriptorSource>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            config,
            version: PollerConfig::version(),
            registry: Arc::new(registry),
            source,
            delivery,
            fleet: Fleet::new(),
        }
    }

    #[cfg(test)]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[cfg(test)]
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    fn supervisor(&self) -> Supervisor {
        let intervals = &self.config.intervals;

        let reconciler = Reconciler::new(
            self.source.clone(),
            self.registry.clone(),
            self.fleet.clone(),
            intervals.cycle(),
        );
        let reconcile_every = intervals.reconcile();

        let dispatcher = Dispatcher::new(self.fleet.clone(), self.delivery.clone());
        let dispatch_every = intervals.dispatch();

        Supervisor::new(intervals.supervise())
            .with_task(
                RECONCILE_TASK,
                task_entry(move || reconciler.clone().run(reconcile_every)),
            )
            .with_task(
                DISPATCH_TASK,
                task_entry(move || dispatcher.clone().run(dispatch_every)),
            )
    }

    /// Version puis modules connus, une seule fois au démarrage
    pub async fn announce(&self) {
        match self.delivery.announce_version(&self.version).await {
            Ok(()) => info!(version = %self.version, "version announced"),
            Err(e) => error!("version announcement failed: {e}"),
        }

        let modules = self.registry.known_modules();
        match self.delivery.announce_modules(&modules).await {
            Ok(()) => info!(count = modules.len(), "modules announced"),
            Err(e) => error!("module announcement failed: {e}"),
        }
    }

    /// Tourne jusqu'à ce que `shutdown` se résolve puis arrête proprement
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut supervisor = self.supervisor();
        supervisor.check();

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.config.startup_delay()) => false,
            _ = &mut shutdown => true,
        };

        if interrupted {
            supervisor.shutdown();
        } else {
            self.announce().await;
            supervisor.run_until(shutdown.as_mut()).await;
        }

        info!("shutting down workers");
        self.fleet.shutdown(self.config.shutdown_grace()).await;
    }

    pub async fn run(self) {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received"),
                Err(e) => {
                    warn!("cannot listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }
}
