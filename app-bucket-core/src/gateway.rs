//! Resolves a bucket record into an opened [`ObjectStore`].
//!
//! The connection string is either literal or read from a key of a secret or
//! config map in the bucket's namespace. Stores are reopened on every call so
//! rotated credentials take effect on the next reconcile.

use std::sync::Arc;

use tracing::debug;

use crate::contract::{ObjectStore, Records, StoreOpener};
use crate::error::{GatewayError, RecordError};
use crate::records::{BucketRecord, ConfigMap, KeyRef, ObjectKey, Record, Secret, UrlSource};

pub struct StorageGateway {
    secrets: Arc<dyn Records<Secret>>,
    config_maps: Arc<dyn Records<ConfigMap>>,
    opener: Arc<dyn StoreOpener>,
}

impl StorageGateway {
    pub fn new(
        secrets: Arc<dyn Records<Secret>>,
        config_maps: Arc<dyn Records<ConfigMap>>,
        opener: Arc<dyn StoreOpener>,
    ) -> Self {
        Self {
            secrets,
            config_maps,
            opener,
        }
    }

    pub async fn resolve(&self, bucket: &BucketRecord) -> Result<Arc<dyn ObjectStore>, GatewayError> {
        let url = self.connection_string(bucket).await?;
        debug!(
            namespace = %bucket.metadata.namespace,
            bucket = %bucket.metadata.name,
            "opening bucket"
        );
        self.opener.open(&url).await
    }

    async fn connection_string(&self, bucket: &BucketRecord) -> Result<String, GatewayError> {
        let namespace = &bucket.metadata.namespace;
        match (&bucket.spec.url, &bucket.spec.url_from) {
            (Some(url), None) if !url.is_empty() => Ok(url.clone()),
            (None, Some(source)) => match source {
                UrlSource {
                    secret_key_ref: Some(key_ref),
                    config_map_key_ref: None,
                } => self.secret_value(namespace, key_ref).await,
                UrlSource {
                    secret_key_ref: None,
                    config_map_key_ref: Some(key_ref),
                } => self.config_map_value(namespace, key_ref).await,
                UrlSource {
                    secret_key_ref: Some(_),
                    config_map_key_ref: Some(_),
                } => Err(GatewayError::InvalidSpec(
                    ".spec.urlFrom must set exactly one of secretKeyRef and configMapKeyRef"
                        .to_string(),
                )),
                UrlSource { .. } => Err(GatewayError::InvalidSpec(
                    ".spec.urlFrom sets no reference".to_string(),
                )),
            },
            (Some(_), Some(_)) => Err(GatewayError::InvalidSpec(
                ".spec must set exactly one of url and urlFrom".to_string(),
            )),
            _ => Err(GatewayError::InvalidSpec("missing url in .spec".to_string())),
        }
    }

    async fn secret_value(&self, namespace: &str, key_ref: &KeyRef) -> Result<String, GatewayError> {
        let secret = self
            .secrets
            .get(&ObjectKey::new(namespace, &key_ref.name))
            .await
            .map_err(|e| reference_error(Secret::KIND, &key_ref.name, e))?;

        let value = secret
            .data
            .get(&key_ref.key)
            .ok_or_else(|| GatewayError::MissingKey {
                kind: Secret::KIND,
                name: key_ref.name.clone(),
                key: key_ref.key.clone(),
            })?;

        String::from_utf8(value.clone()).map_err(|_| GatewayError::InvalidValue {
            kind: Secret::KIND,
            name: key_ref.name.clone(),
            key: key_ref.key.clone(),
        })
    }

    async fn config_map_value(
        &self,
        namespace: &str,
        key_ref: &KeyRef,
    ) -> Result<String, GatewayError> {
        let config_map = self
            .config_maps
            .get(&ObjectKey::new(namespace, &key_ref.name))
            .await
            .map_err(|e| reference_error(ConfigMap::KIND, &key_ref.name, e))?;

        config_map
            .data
            .get(&key_ref.key)
            .cloned()
            .ok_or_else(|| GatewayError::MissingKey {
                kind: ConfigMap::KIND,
                name: key_ref.name.clone(),
                key: key_ref.key.clone(),
            })
    }
}

fn reference_error(kind: &'static str, name: &str, e: RecordError) -> GatewayError {
    if e.is_not_found() {
        GatewayError::ReferenceNotFound {
            kind,
            name: name.to_string(),
        }
    } else {
        GatewayError::Record(e)
    }
}
