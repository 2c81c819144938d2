//! Platform app-association documents and their delivery.
//!
//! The aggregator renders an Android asset-link list and an Apple
//! app-site-association object from its status, then hands both to a
//! [`DeliveryProvisioner`]. [`WellKnownProvisioner`] serves them by writing a
//! config map plus a route record for the configured host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::contract::{create_or_patch, DeliveryProvisioner, Records};
use crate::error::RecordError;
use crate::records::{
    AppRecord, ConfigMap, ObjectKey, ObjectMeta, OwnerRef, Record, RouteSpec, UniversalLinks,
    WellKnownRoute,
};

pub const ASSET_LINKS_FILE: &str = "assetlinks.json";
pub const APPLE_APP_SITE_ASSOCIATION_FILE: &str = "apple-app-site-association";

const HANDLE_ALL_URLS: &str = "delegate_permission/common.handle_all_urls";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLink {
    pub relation: Vec<String>,
    pub target: AssetLinkTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLinkTarget {
    pub namespace: String,
    pub package_name: String,
    pub sha256_cert_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppleAppSiteAssociation {
    pub applinks: AppLinks,
    pub webcredentials: AppList,
    pub appclips: AppList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLinks {
    pub details: Vec<AppLinkDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLinkDetails {
    #[serde(rename = "appIDs")]
    pub app_ids: Vec<String>,
    pub components: Vec<AppLinkComponent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLinkComponent {
    #[serde(rename = "/")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,
}

/// One asset link per package name, fingerprints in sorted order.
pub fn asset_links(targets: &BTreeMap<String, BTreeSet<String>>) -> Vec<AssetLink> {
    targets
        .iter()
        .map(|(package_name, fingerprints)| AssetLink {
            relation: vec![HANDLE_ALL_URLS.to_string()],
            target: AssetLinkTarget {
                namespace: "android_app".to_string(),
                package_name: package_name.clone(),
                sha256_cert_fingerprints: fingerprints.iter().cloned().collect(),
            },
        })
        .collect()
}

pub fn apple_app_site_association(bundle_identifiers: &BTreeSet<String>) -> AppleAppSiteAssociation {
    AppleAppSiteAssociation {
        applinks: AppLinks {
            details: vec![AppLinkDetails {
                app_ids: bundle_identifiers.iter().cloned().collect(),
                components: vec![AppLinkComponent {
                    path: "/".to_string(),
                    comment: "Matches any URL.".to_string(),
                }],
            }],
        },
        webcredentials: AppList::default(),
        appclips: AppList::default(),
    }
}

/// Both documents rendered to their served JSON form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDocuments {
    pub asset_links: String,
    pub apple_app_site_association: String,
}

impl AssociationDocuments {
    pub fn render(
        targets: &BTreeMap<String, BTreeSet<String>>,
        bundle_identifiers: &BTreeSet<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            asset_links: serde_json::to_string_pretty(&asset_links(targets))?,
            apple_app_site_association: serde_json::to_string_pretty(
                &apple_app_site_association(bundle_identifiers),
            )?,
        })
    }
}

/// Serves the documents through a config map and a [`WellKnownRoute`], both
/// named `<app>-well-known` and owned by the app.
pub struct WellKnownProvisioner {
    config_maps: Arc<dyn Records<ConfigMap>>,
    routes: Arc<dyn Records<WellKnownRoute>>,
}

impl WellKnownProvisioner {
    pub fn new(
        config_maps: Arc<dyn Records<ConfigMap>>,
        routes: Arc<dyn Records<WellKnownRoute>>,
    ) -> Self {
        Self {
            config_maps,
            routes,
        }
    }

    pub fn resource_name(app: &AppRecord) -> String {
        format!("{}-well-known", app.metadata.name)
    }

    fn owned_meta(app: &AppRecord) -> ObjectMeta {
        let mut meta = ObjectMeta::new(&app.metadata.namespace, Self::resource_name(app));
        meta.owner = Some(OwnerRef {
            kind: AppRecord::KIND.to_string(),
            name: app.metadata.name.clone(),
        });
        meta
    }
}

#[async_trait]
impl DeliveryProvisioner for WellKnownProvisioner {
    async fn provision(
        &self,
        app: &AppRecord,
        links: &UniversalLinks,
        documents: &AssociationDocuments,
    ) -> Result<(), RecordError> {
        let name = Self::resource_name(app);

        let config_map = ConfigMap {
            metadata: Self::owned_meta(app),
            data: BTreeMap::from([
                (ASSET_LINKS_FILE.to_string(), documents.asset_links.clone()),
                (
                    APPLE_APP_SITE_ASSOCIATION_FILE.to_string(),
                    documents.apple_app_site_association.clone(),
                ),
            ]),
        };
        create_or_patch(self.config_maps.as_ref(), config_map).await?;

        let route = WellKnownRoute {
            metadata: Self::owned_meta(app),
            spec: RouteSpec {
                host: links.host.clone(),
                config_map: name.clone(),
                issuer: links.issuer.clone(),
                paths: vec![
                    format!("/.well-known/{ASSET_LINKS_FILE}"),
                    format!("/.well-known/{APPLE_APP_SITE_ASSOCIATION_FILE}"),
                ],
            },
        };
        create_or_patch(self.routes.as_ref(), route).await?;

        info!(
            namespace = %app.metadata.namespace,
            app = %app.metadata.name,
            host = %links.host,
            "well-known documents provisioned"
        );
        Ok(())
    }

    async fn withdraw(&self, app: &AppRecord) -> Result<(), RecordError> {
        let key = ObjectKey::new(&app.metadata.namespace, Self::resource_name(app));

        let mut removed = false;
        match self.routes.delete(&key).await {
            Ok(()) => removed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.config_maps.delete(&key).await {
            Ok(()) => removed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if removed {
            info!(namespace = %key.namespace, app = %app.metadata.name, "well-known documents withdrawn");
        }
        Ok(())
    }
}
