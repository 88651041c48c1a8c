//! Resolve-only build preview.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::registry::RegistryClient;
use crate::resolver::Resolver;

/// What a build would download, without downloading anything.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub providers: Vec<PlannedProvider>,
    pub total_versions: usize,
    pub total_downloads: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedProvider {
    pub source: String,
    pub hostname: String,
    pub versions: Vec<PlannedVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedVersion {
    pub version: String,
    pub platforms: Vec<String>,
}

/// Plans a mirror build by running the resolver only. Shares no state with
/// an in-progress build.
pub struct Planner {
    client: Arc<dyn RegistryClient>,
}

impl Planner {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }

    pub async fn plan(&self, cancel: &CancellationToken, manifest: &Manifest) -> Result<Plan> {
        let resolution = Resolver::new(Arc::clone(&self.client))
            .resolve(cancel, manifest)
            .await?;

        let mut plan = Plan {
            providers: Vec::with_capacity(resolution.providers.len()),
            total_versions: 0,
            total_downloads: 0,
        };

        for rp in &resolution.providers {
            let mut planned = PlannedProvider {
                source: rp.source.to_string(),
                hostname: rp.source.hostname.clone(),
                versions: Vec::with_capacity(rp.versions.len()),
            };

            for rv in &rp.versions {
                plan.total_versions += 1;
                plan.total_downloads += rv.platforms.len();
                planned.versions.push(PlannedVersion {
                    version: rv.version.clone(),
                    platforms: rv.platforms.clone(),
                });
            }

            plan.providers.push(planned);
        }

        Ok(plan)
    }
}
