/**
 * SYMBION POLLER - Collecte périodique sur un parc d'équipements réseau
 *
 * RÔLE : maintient un worker de collecte par équipement déclaré dans le registre,
 * agrège les mesures par équipement et les publie vers le backend via MQTT.
 *
 * ARCHITECTURE : supervisor -> reconcile (registre -> workers) + dispatch (workers -> MQTT).
 */

mod config;
mod data;
mod delivery;
mod dispatcher;
mod models;
mod modules;
mod poller;
mod reconciler;
mod source;
mod state;
mod supervisor;
mod worker;

#[cfg(test)]
mod testing;

use crate::config::load_config;
use crate::delivery::MqttDelivery;
use crate::modules::ModuleRegistry;
use crate::poller::Poller;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("symbion_poller=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config().await;
    info!(
        version = %config::PollerConfig::version(),
        mqtt = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "symbion-poller starting"
    );

    let source = source::from_config(&cfg.source).context("failed to build descriptor source")?;
    let delivery = Arc::new(MqttDelivery::connect(&cfg.mqtt));
    let registry = ModuleRegistry::builtin();
    info!(device_types = ?registry.device_types(), "drivers loaded");

    Poller::new(cfg, registry, Arc::from(source), delivery).run().await;

    info!("symbion-poller stopped");
    Ok(())
}
