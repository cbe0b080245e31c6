use super::{
    CollectError, CollectionModule, ModuleContext, ModuleFactory, ModuleSchema, SettingKind,
};
use crate::config::ConfigError;
use crate::data::{now_unix, Event, LiveData, ModuleData, OutputKind};
use async_trait::async_trait;
use reqwest::header::SERVER;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;

pub const STATUS_ID: &str = "http_status";
pub const JSON_ID: &str = "http_json";

const SCHEMES: &[&str] = &["http", "https"];

pub fn status_factory() -> ModuleFactory {
    let schema = ModuleSchema::new()
        .with_default_timeout(10)
        .item(SettingKind::String, "scheme", "Scheme (http/https)", Some(json!("http")))
        .one_of(SCHEMES)
        .item(SettingKind::String, "path", "Request path", Some(json!("/")))
        .item(SettingKind::Boolean, "verify_tls", "Verify TLS certificates", Some(json!(true)));

    ModuleFactory::new(STATUS_ID, schema, |ctx| {
        Ok(Box::new(HttpStatus {
            client: client(&ctx)?,
            url: device_url(&ctx)?,
        }))
    })
}

pub fn json_factory() -> ModuleFactory {
    let schema = ModuleSchema::new()
        .with_default_timeout(10)
        .item(SettingKind::String, "scheme", "Scheme (http/https)", Some(json!("http")))
        .one_of(SCHEMES)
        .item(SettingKind::String, "path", "JSON document path", None)
        .item(SettingKind::String, "key", "Output key", Some(json!("controller")))
        .item(SettingKind::String, "output", "Output (default/external)", Some(json!("default")))
        .one_of(&["default", "external"])
        .item(SettingKind::Boolean, "verify_tls", "Verify TLS certificates", Some(json!(true)))
        .item(SettingKind::Password, "token", "Bearer token (empty: none)", Some(json!("")));

    ModuleFactory::new(JSON_ID, schema, |ctx| {
        let output = match ctx.setting_str("output")? {
            "default" => OutputKind::Default,
            "external" => OutputKind::External,
            _ => return Err(ctx.invalid("output")),
        };
        Ok(Box::new(HttpJson {
            client: client(&ctx)?,
            url: device_url(&ctx)?,
            key: ctx.setting_str("key")?.to_string(),
            token: Some(ctx.setting_str("token")?)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            output,
        }))
    })
}

fn client(ctx: &ModuleContext) -> Result<Client, ConfigError> {
    // les interfaces d'administration ont souvent un certificat auto-signé
    let verify_tls = ctx.setting_bool("verify_tls")?;
    Client::builder()
        .timeout(ctx.io_timeout())
        .danger_accept_invalid_certs(!verify_tls)
        .build()
        .map_err(|e| ConfigError::ModuleInit {
            module: ctx.module_id.clone(),
            reason: e.to_string(),
        })
}

fn device_url(ctx: &ModuleContext) -> Result<String, ConfigError> {
    let scheme = ctx.setting_str("scheme")?;
    if !SCHEMES.contains(&scheme) {
        return Err(ctx.invalid("scheme"));
    }
    let path = ctx.setting_str("path")?;
    let path = path.strip_prefix('/').unwrap_or(path);
    Ok(format!("{scheme}://{}/{path}", ctx.address))
}

// Un refus de connexion n'est pas une erreur HTTP à proprement parler
fn send_error(url: &str, e: reqwest::Error) -> CollectError {
    if e.is_connect() {
        CollectError::Connection {
            address: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        CollectError::Http(e)
    }
}

/// Statut HTTP et temps de réponse de l'interface web de l'équipement
pub struct HttpStatus {
    client: Client,
    url: String,
}

#[async_trait]
impl CollectionModule for HttpStatus {
    fn id(&self) -> &str {
        STATUS_ID
    }

    async fn collect(&mut self) -> Result<ModuleData, CollectError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| send_error(&self.url, e))?;
        let elapsed = started.elapsed();

        let server = response
            .headers()
            .get(SERVER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(ModuleData::new()
            .with_static(
                "http",
                json!({"status": response.status().as_u16(), "server": server}),
            )
            .push(
                LiveData::new("response_ms", now_unix(), elapsed.as_secs_f64() * 1000.0)
                    .at_path("http"),
            ))
    }
}

/// Document JSON exposé par un contrôleur
pub struct HttpJson {
    client: Client,
    url: String,
    key: String,
    token: Option<String>,
    output: OutputKind,
}

#[async_trait]
impl CollectionModule for HttpJson {
    fn id(&self) -> &str {
        JSON_ID
    }

    async fn collect(&mut self) -> Result<ModuleData, CollectError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| send_error(&self.url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Protocol(format!("{} returned {status}", self.url)));
        }
        let document: Value = serde_json::from_slice(&response.bytes().await?)?;

        Ok(match self.output {
            OutputKind::Default => ModuleData::new().with_static(self.key.clone(), document),
            OutputKind::External => ModuleData::new()
                .external()
                .push(Event::new(self.key.clone(), document)),
        })
    }
}
