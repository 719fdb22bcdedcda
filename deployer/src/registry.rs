use async_trait::async_trait;
use flowplane_common::backends::client::ServicesApiClient;
use http::{Method, StatusCode};
use serde::Deserialize;

use crate::build::StageError;

/// Confirms a pushed image before it is handed to a deploy target.
#[async_trait]
pub trait RegistryCheck: Send + Sync {
    /// Fail fatally when the tag does not exist, or when `require_amd64` is
    /// set and the manifest carries no linux/amd64 variant.
    async fn verify_image(&self, image_tag: &str, require_amd64: bool) -> Result<(), StageError>;
}

/// Registry v2 API client.
pub struct RegistryClient {
    api: ServicesApiClient,
    token: String,
}

#[derive(Deserialize)]
struct ManifestList {
    #[serde(default)]
    manifests: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    #[serde(default)]
    os: Option<String>,
}

impl RegistryClient {
    pub fn new(api: ServicesApiClient, token: String) -> Self {
        Self { api, token }
    }

    /// Split `host/name:tag` into the repository path and the tag.
    fn split_tag(image_tag: &str) -> Result<(String, String), StageError> {
        let without_host = image_tag
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(image_tag);

        match without_host.rsplit_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {
                Ok((name.to_string(), tag.to_string()))
            }
            _ => Err(StageError::Fatal(format!(
                "image tag '{image_tag}' is not of the form name:tag"
            ))),
        }
    }
}

#[async_trait]
impl RegistryCheck for RegistryClient {
    async fn verify_image(&self, image_tag: &str, require_amd64: bool) -> Result<(), StageError> {
        let (name, tag) = Self::split_tag(image_tag)?;

        let manifest: Result<ManifestList, _> = self
            .api
            .request::<(), _>(
                Method::GET,
                &format!("v2/{name}/manifests/{tag}"),
                None,
                Some(&self.token),
            )
            .await;

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {
                return Err(StageError::Fatal(format!(
                    "image '{image_tag}' was not found in the registry"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if require_amd64 {
            let has_amd64 = manifest.manifests.iter().any(|entry| {
                entry.platform.as_ref().is_some_and(|platform| {
                    platform.architecture == "amd64"
                        && platform.os.as_deref().unwrap_or("linux") == "linux"
                })
            });

            if !has_amd64 {
                return Err(StageError::Fatal(format!(
                    "image '{image_tag}' has no linux/amd64 variant required by the deploy target"
                )));
            }
        }

        Ok(())
    }
}
