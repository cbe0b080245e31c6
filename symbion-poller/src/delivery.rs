/**
 * DELIVERY - Publication des annonces et des lots vers le backend
 *
 * TOPICS (préfixe configurable, défaut symbion/poller) :
 * - {prefix}/version@v1 : version du poller, une fois au démarrage
 * - {prefix}/modules@v1 : modules connus et leurs schémas, une fois au démarrage
 * - {prefix}/data@v1    : lot {"devices": [...]} à chaque cycle du dispatcher
 *
 * La boucle d'événements MQTT tourne dans une task dédiée qui se reconnecte seule.
 * Broker injoignable ou file du client pleine : l'envoi échoue tout de suite, rien
 * n'est mis en attente pour plus tard.
 */

use crate::config::MqttConf;
use crate::models::Batch;
use crate::modules::KnownModule;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT broker {0} not connected")]
    Offline(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("payload of {size} bytes exceeds the {max} bytes limit")]
    TooLarge { size: usize, max: usize },
}

/// Canal de sortie vers le backend
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn announce_version(&self, version: &str) -> Result<(), DeliveryError>;

    async fn announce_modules(&self, modules: &[KnownModule]) -> Result<(), DeliveryError>;

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Version,
    Modules,
    Data,
}

pub fn topic(prefix: &str, topic: Topic) -> String {
    let name = match topic {
        Topic::Version => "version",
        Topic::Modules => "modules",
        Topic::Data => "data",
    };
    format!("{}/{}@v1", prefix.trim_end_matches('/'), name)
}

#[derive(Serialize)]
struct VersionPayload<'a> {
    version: &'a str,
}

#[derive(Serialize)]
struct ModulesPayload<'a> {
    modules: &'a [KnownModule],
}

/// État de la connexion broker, mis à jour par la boucle d'événements
#[derive(Debug, Default)]
pub struct LinkState {
    connected: AtomicBool,
    reconnects: AtomicU32,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

pub struct MqttDelivery {
    client: AsyncClient,
    broker: String,
    prefix: String,
    max_packet: usize,
    link: Arc<LinkState>,
    eventloop: JoinHandle<()>,
}

impl MqttDelivery {
    /// Crée le client et démarre la boucle d'événements en arrière-plan
    pub fn connect(conf: &MqttConf) -> Self {
        let max_packet = conf.max_packet_kb * 1024;
        let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        opts.set_max_packet_size(max_packet, max_packet);

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let link = Arc::new(LinkState::default());

        let state = link.clone();
        let broker = format!("{}:{}", conf.host, conf.port);
        let host = broker.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        state.connected.store(true, Ordering::Relaxed);
                        info!(reconnects = state.reconnects(), "connected to MQTT broker {host}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if state.connected.swap(false, Ordering::Relaxed) {
                            state.reconnects.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!("MQTT error: {e:?}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            broker,
            prefix: conf.topic_prefix.clone(),
            max_packet,
            link,
            eventloop: handle,
        }
    }

    #[cfg(test)]
    pub fn link(&self) -> Arc<LinkState> {
        self.link.clone()
    }

    /// Dépôt immédiat dans la file du client, jamais d'attente sur un broker absent
    fn publish<T>(&self, kind: Topic, payload: &T) -> Result<(), DeliveryError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(payload)?;
        if payload.len() > self.max_packet {
            return Err(DeliveryError::TooLarge {
                size: payload.len(),
                max: self.max_packet,
            });
        }
        if !self.link.is_connected() {
            return Err(DeliveryError::Offline(self.broker.clone()));
        }
        let topic = topic(&self.prefix, kind);
        debug!(%topic, bytes = payload.len(), "publishing");
        self.client.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

impl Drop for MqttDelivery {
    fn drop(&mut self) {
        self.eventloop.abort();
    }
}

#[async_trait]
impl Delivery for MqttDelivery {
    async fn announce_version(&self, version: &str) -> Result<(), DeliveryError> {
        self.publish(Topic::Version, &VersionPayload { version })
    }

    async fn announce_modules(&self, modules: &[KnownModule]) -> Result<(), DeliveryError> {
        self.publish(Topic::Modules, &ModulesPayload { modules })
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        self.publish(Topic::Data, batch)
    }
}
