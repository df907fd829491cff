//! Manifest resolution
//!
//! Asks the update server which bundle the device should run for a channel.
//! Resolution has no side effects; every failure surfaces as
//! `ResolveFailed` and is never mistaken for "no update".

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::error::{UpdateError, UpdateResult};
use crate::core::types::{BundleId, Channel};

/// Path of the check endpoint below the update server
pub const CHECK_PATH: &str = "api/v1/bundles/check";

/// A bundle the server wants the device to install
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescriptor {
    pub bundle_id: BundleId,
    pub zip_url: String,
    /// SHA256 of the archive, optionally prefixed with `sha256:`
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Outcome of a manifest query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    UpdateAvailable(UpdateDescriptor),
    NoUpdate,
}

/// Source of update descriptors
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    async fn resolve(
        &self,
        channel: &Channel,
        current_bundle_id: Option<&BundleId>,
    ) -> UpdateResult<ResolveOutcome>;
}

/// Resolver backed by the update server's HTTP check endpoint
pub struct HttpManifestResolver {
    client: reqwest::Client,
    check_url: reqwest::Url,
    app_version: Option<String>,
    platform: String,
}

impl HttpManifestResolver {
    pub fn new(
        client: reqwest::Client,
        update_server: &str,
        app_version: Option<String>,
        platform: impl Into<String>,
    ) -> UpdateResult<Self> {
        let base = if update_server.ends_with('/') {
            update_server.to_string()
        } else {
            format!("{}/", update_server)
        };
        let check_url = reqwest::Url::parse(&base)
            .and_then(|u| u.join(CHECK_PATH))
            .map_err(|e| UpdateError::InvalidUrl(format!("{}: {}", update_server, e)))?;

        Ok(Self {
            client,
            check_url,
            app_version,
            platform: platform.into(),
        })
    }

    pub fn check_url(&self) -> &reqwest::Url {
        &self.check_url
    }
}

#[async_trait]
impl ManifestResolver for HttpManifestResolver {
    async fn resolve(
        &self,
        channel: &Channel,
        current_bundle_id: Option<&BundleId>,
    ) -> UpdateResult<ResolveOutcome> {
        let current = BundleId::wire(current_bundle_id);
        info!(
            "Checking for bundle updates (channel: {}, current: {})",
            channel, current
        );

        let response = self
            .client
            .get(self.check_url.clone())
            .query(&[
                ("channel", channel.as_str()),
                ("bundleId", current),
                ("appVersion", self.app_version.as_deref().unwrap_or("")),
                ("platform", self.platform.as_str()),
            ])
            .send()
            .await
            .map_err(|e| UpdateError::ResolveFailed(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            debug!("Update server answered 204, no update");
            return Ok(ResolveOutcome::NoUpdate);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(UpdateError::ResolveFailed(format!(
                "rate limited, retry after {}s",
                retry_after
            )));
        }

        if !status.is_success() {
            return Err(UpdateError::ResolveFailed(format!(
                "server returned status: {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::ResolveFailed(format!("reading response: {}", e)))?;
        let descriptor = parse_check_response(&body)?;

        match descriptor {
            Some(d) if Some(&d.bundle_id) != current_bundle_id => {
                info!("Update available: {} ({})", d.bundle_id, d.zip_url);
                Ok(ResolveOutcome::UpdateAvailable(d))
            }
            _ => {
                debug!("Bundle {} is current", current);
                Ok(ResolveOutcome::NoUpdate)
            }
        }
    }
}

/// Parse the body of a `200` check response (`null` or a descriptor)
pub fn parse_check_response(body: &str) -> UpdateResult<Option<UpdateDescriptor>> {
    serde_json::from_str::<Option<UpdateDescriptor>>(body)
        .map_err(|e| UpdateError::ResolveFailed(format!("malformed manifest: {}", e)))
}
