/**
 * SUPERVISOR - Garde en vie les tâches système du poller
 *
 * Liste fixe de tâches nommées (reconcile, dispatch). À chaque tick, une tâche
 * terminée (retour normal ou panic) est relancée sous le même nom avec le même point
 * d'entrée, une tâche jamais démarrée est démarrée. Pas d'enregistrement dynamique.
 */

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Point d'entrée d'une tâche, rappelable à chaque redémarrage
pub type TaskEntry = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub fn task_entry<F, Fut>(entry: F) -> TaskEntry
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || entry().boxed())
}

pub struct Supervisor {
    every: Duration,
    roster: Vec<(String, TaskEntry)>,
    running: HashMap<String, JoinHandle<()>>,
    restarts: HashMap<String, u32>,
}

impl Supervisor {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            roster: Vec::new(),
            running: HashMap::new(),
            restarts: HashMap::new(),
        }
    }

    pub fn with_task(mut self, name: &str, entry: TaskEntry) -> Self {
        self.roster.push((name.to_string(), entry));
        self
    }

    #[cfg(test)]
    pub fn restarts(&self, name: &str) -> u32 {
        self.restarts.get(name).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.running.get(name).is_some_and(|handle| !handle.is_finished())
    }

    /// Démarre ce qui manque, relance ce qui s'est terminé. Renvoie les noms lancés.
    pub fn check(&mut self) -> Vec<String> {
        let mut launched = Vec::new();

        for (name, entry) in &self.roster {
            match self.running.remove(name) {
                Some(handle) if !handle.is_finished() => {
                    self.running.insert(name.clone(), handle);
                    continue;
                }
                Some(handle) => {
                    match handle.now_or_never() {
                        Some(Err(e)) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            error!(task = %name, "system task panicked: {message}");
                        }
                        Some(Err(e)) => warn!(task = %name, "system task cancelled: {e}"),
                        _ => warn!(task = %name, "system task exited"),
                    }
                    let restarts = self.restarts.entry(name.clone()).or_default();
                    *restarts += 1;
                    info!(task = %name, restarts = *restarts, "restarting system task");
                }
                None => info!(task = %name, "starting system task"),
            }

            self.running.insert(name.clone(), tokio::spawn(entry()));
            launched.push(name.clone());
        }

        launched
    }

    /// Surveille jusqu'à ce que `shutdown` se résolve, puis arrête les tâches
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.check();
                }
            }
        }

        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        for (name, handle) in self.running.drain() {
            handle.abort();
            info!(task = %name, "system task stopped");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
