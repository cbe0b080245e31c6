use super::{
    CollectError, CollectionModule, ModuleContext, ModuleFactory, ModuleSchema, SettingKind,
};
use crate::data::{now_unix, Event, LiveData, ModuleData};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

pub const ID: &str = "reachability";

pub fn factory() -> ModuleFactory {
    let schema = ModuleSchema::new()
        .with_default_timeout(5)
        .item(SettingKind::Integer, "port", "TCP port", Some(json!(22)))
        .at_most(u64::from(u16::MAX));

    ModuleFactory::new(ID, schema, |ctx| {
        let port = ctx.setting_u64("port")?;
        let port = u16::try_from(port).map_err(|_| ctx.invalid("port"))?;
        Ok(Box::new(Reachability::new(&ctx, port)))
    })
}

/// Connexion TCP sur un port, latence mesurée et changement d'état signalé
pub struct Reachability {
    address: String,
    port: u16,
    timeout: Duration,
    last_state: Option<bool>,
}

impl Reachability {
    pub fn new(ctx: &ModuleContext, port: u16) -> Self {
        Self {
            address: ctx.address.clone(),
            port,
            timeout: ctx.io_timeout(),
            last_state: None,
        }
    }

    async fn probe(&self) -> Option<Duration> {
        let started = Instant::now();
        let target = (self.address.as_str(), self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(address = %self.address, port = self.port, "connect failed: {e}");
                None
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl CollectionModule for Reachability {
    fn id(&self) -> &str {
        ID
    }

    async fn collect(&mut self) -> Result<ModuleData, CollectError> {
        let latency = self.probe().await;
        let reachable = latency.is_some();

        let mut data = ModuleData::new().with_static(
            "reachability",
            json!({"port": self.port, "reachable": reachable}),
        );

        if let Some(latency) = latency {
            let ms = latency.as_secs_f64() * 1000.0;
            data = data.push(LiveData::new("latency_ms", now_unix(), ms).at_path("reachability"));
        }

        if self.last_state != Some(reachable) {
            data = data.push(Event::new(
                ID,
                json!({"port": self.port, "reachable": reachable}),
            ));
        }
        self.last_state = Some(reachable);

        Ok(data)
    }
}
