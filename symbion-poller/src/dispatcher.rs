use crate::delivery::Delivery;
use crate::models::{Batch, DeviceRecord};
use crate::reconciler::Fleet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Résultat d'un cycle d'envoi
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Rien à envoyer, aucun appel à la delivery
    Empty,
    Delivered(usize),
    /// Lot perdu, pas de nouvel essai
    Dropped(usize),
}

/// Vide périodiquement les accumulateurs et envoie un lot unique
#[derive(Clone)]
pub struct Dispatcher {
    fleet: Fleet,
    delivery: Arc<dyn Delivery>,
}

impl Dispatcher {
    pub fn new(fleet: Fleet, delivery: Arc<dyn Delivery>) -> Self {
        Self { fleet, delivery }
    }

    /// Draine chaque worker vivant, seuls les résultats non vides entrent dans le lot
    pub fn collect_batch(&self) -> Batch {
        let mut devices: Vec<DeviceRecord> = self
            .fleet
            .snapshot()
            .into_iter()
            .filter_map(|view| {
                let data = view.data.lock().drain();
                if data.is_empty() {
                    None
                } else {
                    Some(DeviceRecord {
                        id: view.id,
                        name: view.name,
                        data,
                    })
                }
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Batch { devices }
    }

    pub async fn dispatch_once(&self) -> DispatchOutcome {
        let batch = self.collect_batch();
        if batch.is_empty() {
            debug!("nothing to dispatch");
            return DispatchOutcome::Empty;
        }

        let count = batch.len();
        match self.delivery.deliver(&batch).await {
            Ok(()) => {
                info!(devices = count, "batch delivered");
                DispatchOutcome::Delivered(count)
            }
            Err(e) => {
                warn!(devices = count, "delivery failed, batch dropped: {e}");
                DispatchOutcome::Dropped(count)
            }
        }
    }

    pub async fn run(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // le premier tick est immédiat, les workers n'ont encore rien produit
        interval.tick().await;
        loop {
            interval.tick().await;
            self.dispatch_once().await;
        }
    }
}
