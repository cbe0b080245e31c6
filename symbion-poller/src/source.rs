//! Fournisseurs de la liste désirée des équipements (registre HTTP ou fichier local).

use crate::config::SourceConf;
use crate::models::DeviceDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned {0}")]
    Status(reqwest::StatusCode),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document: {0}")]
    Parse(String),
}

/// Fournit l'état désiré complet à chaque passe de réconciliation
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<DeviceDescriptor>, SourceError>;
}

/// Accepte un tableau de descripteurs ou un objet `{"devices": [...]}`.
/// Les entrées mal formées sont ignorées une par une.
pub fn parse_descriptors(document: Value) -> Result<Vec<DeviceDescriptor>, SourceError> {
    let entries = match document {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("devices") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(SourceError::Parse("expected a `devices` array".into())),
        },
        Value::Null => Vec::new(),
        _ => return Err(SourceError::Parse("expected an array of devices".into())),
    };

    let mut descriptors = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<DeviceDescriptor>(entry) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => warn!("skipping malformed device entry #{index}: {e}"),
        }
    }
    Ok(descriptors)
}

pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl DescriptorSource for HttpSource {
    async fn fetch(&self) -> Result<Vec<DeviceDescriptor>, SourceError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let document: Value =
            serde_json::from_slice(&body).map_err(|e| SourceError::Parse(e.to_string()))?;
        parse_descriptors(document)
    }
}

/// Fichier YAML ou JSON, relu à chaque passe
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DescriptorSource for FileSource {
    async fn fetch(&self) -> Result<Vec<DeviceDescriptor>, SourceError> {
        let txt = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io { path: self.path.clone(), source })?;
        // YAML est un sur-ensemble de JSON : un seul parseur suffit
        let document: Value =
            serde_yaml::from_str(&txt).map_err(|e| SourceError::Parse(e.to_string()))?;
        parse_descriptors(document)
    }
}

pub fn from_config(conf: &SourceConf) -> Result<Box<dyn DescriptorSource>, SourceError> {
    Ok(match conf {
        SourceConf::Http { url, timeout_secs } => {
            Box::new(HttpSource::new(url.clone(), Duration::from_secs(*timeout_secs))?)
        }
        SourceConf::File { path } => Box::new(FileSource::new(path.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_array_and_wrapped_documents() {
        let entry = json!({"id": 1, "name": "sw", "type": "switch", "address": "10.0.0.1"});

        let bare = parse_descriptors(json!([entry.clone()])).unwrap();
        let wrapped = parse_descriptors(json!({"devices": [entry]})).unwrap();
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].id, "1");
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let descriptors = parse_descriptors(json!([
            {"id": 1, "name": "sw", "type": "switch", "address": "10.0.0.1"},
            {"name": "no-id", "type": "switch", "address": "10.0.0.2"},
            "garbage",
            {"id": "ap-3", "name": "ap", "type": "access_point", "ip": "10.0.0.3"}
        ]))
        .unwrap();

        let ids: Vec<_> = descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "ap-3"]);
    }

    #[test]
    fn test_parse_rejects_scalar_document() {
        assert!(matches!(parse_descriptors(json!(42)), Err(SourceError::Parse(_))));
        assert!(parse_descriptors(Value::Null).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
devices:
  - id: 7
    name: core-sw
    type: switch
    address: 10.0.0.7
    timeout: 5
    modules:
      - id: reachability
        config:
          port: 2222
"#
        )
        .unwrap();

        let source = FileSource::new(file.path());
        let descriptors = source.fetch().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, "7");
        assert_eq!(descriptors[0].modules[0].config["port"], json!(2222));
    }

    #[tokio::test]
    async fn test_file_source_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let body = r#"[{"id": "a", "name": "a", "type": "controller", "address": "h"}]"#;
        write!(file, "{body}").unwrap();

        let descriptors = FileSource::new(file.path()).fetch().await.unwrap();
        assert_eq!(descriptors[0].device_type, "controller");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("absent.yaml"));
        assert!(matches!(source.fetch().await, Err(SourceError::Io { .. })));
    }
}
