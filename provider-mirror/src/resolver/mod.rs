//! Constraint resolution against provider registries.
//!
//! Resolution is a two-pass process. Pass one groups manifest expansions by
//! provider identity and exact constraint string; within each group there is
//! one work item per distinct registry hostname, because the same logical
//! provider lives on both default registries when targeting both engines and
//! their version lists diverge. Pass two resolves every work item to that
//! registry's single latest matching version, then merges the results so the
//! same concrete version reached through several manifest entries carries the
//! union of platforms and manifest sources.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use semver::Version;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ProviderSource};
use crate::registry::RegistryClient;

pub mod constraint;

use constraint::{parse_lenient, Constraint};

/// A provider with resolved concrete versions. Identity is
/// `(hostname, namespace, name)`: the same `namespace/name` on two hostnames
/// is two distinct resolved providers.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedProvider {
    pub source: ProviderSource,
    /// Sorted by semver, newest first.
    pub versions: Vec<ResolvedVersion>,
}

/// A single resolved version with its platform set and provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedVersion {
    /// The registry's original version string.
    pub version: String,
    /// Sorted ascending.
    pub platforms: Vec<String>,
    /// Deduplicated manifest `source` strings that contributed this version,
    /// sorted ascending.
    pub manifest_sources: Vec<String>,
}

/// The complete resolution result, ordered by
/// `(hostname, namespace, name)` ascending.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    pub providers: Vec<ResolvedProvider>,
}

/// Resolves provider version constraints against registries.
pub struct Resolver {
    client: Arc<dyn RegistryClient>,
}

/// One registry-scoped work item inside a constraint bucket.
#[derive(Debug, Default)]
struct BucketEntry {
    platforms: Vec<String>,
    sources: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MergedVersion {
    platforms: BTreeSet<String>,
    sources: BTreeSet<String>,
}

type VersionKey = (String, String, String, String);

impl Resolver {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }

    /// Resolves all manifest entries to concrete versions.
    ///
    /// Each constraint resolves independently per registry to that
    /// registry's latest matching version; a registry listing no matching
    /// version fails the whole resolution.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        manifest: &Manifest,
    ) -> Result<Resolution> {
        let expanded = manifest.expanded_providers()?;

        // Pass 1: (namespace, name) -> constraint string -> hostname -> entry.
        let mut groups: BTreeMap<(String, String), BTreeMap<String, BTreeMap<String, BucketEntry>>> =
            BTreeMap::new();

        for ep in &expanded {
            for constraint in &ep.constraints {
                let entry = groups
                    .entry((ep.source.namespace.clone(), ep.source.name.clone()))
                    .or_default()
                    .entry(constraint.clone())
                    .or_default()
                    .entry(ep.source.hostname.clone())
                    .or_default();

                for platform in &ep.platforms {
                    if !entry.platforms.contains(platform) {
                        entry.platforms.push(platform.clone());
                    }
                }
                entry.sources.insert(ep.source_spec.clone());
            }
        }

        // Pass 2: resolve every (constraint, hostname) work item and merge
        // into (hostname, namespace, name, version)-keyed accumulators.
        let mut merged: BTreeMap<VersionKey, MergedVersion> = BTreeMap::new();

        for ((namespace, name), constraints) in &groups {
            for (constraint_str, by_host) in constraints {
                let constraint = Constraint::parse(constraint_str)?;

                for (hostname, entry) in by_host {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    let selected = self
                        .resolve_one(cancel, hostname, namespace, name, &constraint, entry)
                        .await?;

                    let key = (
                        hostname.clone(),
                        namespace.clone(),
                        name.clone(),
                        selected,
                    );
                    let slot = merged.entry(key).or_default();
                    slot.platforms.extend(entry.platforms.iter().cloned());
                    slot.sources.extend(entry.sources.iter().cloned());
                }
            }
        }

        Ok(build_resolution(merged))
    }

    /// Picks the latest version on one registry satisfying `constraint` and
    /// checks that every requested platform is published for it. Returns the
    /// registry's original version string.
    async fn resolve_one(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
        namespace: &str,
        name: &str,
        constraint: &Constraint,
        entry: &BucketEntry,
    ) -> Result<String> {
        let listing = self
            .client
            .get_versions(cancel, hostname, namespace, name)
            .await?;

        let mut best: Option<(Version, usize)> = None;
        for (idx, pv) in listing.versions.iter().enumerate() {
            // Version strings the registry advertises but we cannot parse
            // are skipped rather than failing the resolution.
            let Some((parsed, _)) = parse_lenient(&pv.version) else {
                continue;
            };
            if !constraint.matches(&parsed) {
                continue;
            }

            let replace = match &best {
                None => true,
                Some((current, current_idx)) => match parsed.cmp_precedence(current) {
                    std::cmp::Ordering::Greater => true,
                    // Equal under semver: keep the lexicographically greater
                    // original string (e.g. "1.0.0" over "1.0").
                    std::cmp::Ordering::Equal => {
                        pv.version > listing.versions[*current_idx].version
                    }
                    std::cmp::Ordering::Less => false,
                },
            };
            if replace {
                best = Some((parsed, idx));
            }
        }

        let Some((_, idx)) = best else {
            return Err(Error::NotFound {
                hostname: hostname.to_string(),
                subject: format!(
                    "version of {namespace}/{name} matching {:?}",
                    constraint.original()
                ),
            });
        };

        let selected = &listing.versions[idx];
        let available: HashSet<String> =
            selected.platforms.iter().map(|p| p.to_string()).collect();

        for requested in &entry.platforms {
            if !available.contains(requested) {
                return Err(Error::PlatformUnavailable {
                    provider: format!("{hostname}/{namespace}/{name}"),
                    version: selected.version.clone(),
                    platform: requested.clone(),
                });
            }
        }

        debug!(
            hostname = %hostname,
            provider = %format!("{namespace}/{name}"),
            constraint = constraint.original(),
            version = %selected.version,
            "constraint resolved"
        );

        Ok(selected.version.clone())
    }
}

/// Builds the sorted `Resolution` from the merged accumulators.
fn build_resolution(merged: BTreeMap<VersionKey, MergedVersion>) -> Resolution {
    // Group by provider identity; BTreeMap keeps the required ascending
    // (hostname, namespace, name) order.
    let mut by_provider: BTreeMap<(String, String, String), Vec<ResolvedVersion>> = BTreeMap::new();

    for ((hostname, namespace, name, version), slot) in merged {
        by_provider
            .entry((hostname, namespace, name))
            .or_default()
            .push(ResolvedVersion {
                version,
                platforms: slot.platforms.into_iter().collect(),
                manifest_sources: slot.sources.into_iter().collect(),
            });
    }

    let mut providers = Vec::with_capacity(by_provider.len());
    for ((hostname, namespace, name), mut versions) in by_provider {
        versions.sort_by(|a, b| compare_versions_desc(&a.version, &b.version));
        providers.push(ResolvedProvider {
            source: ProviderSource {
                hostname,
                namespace,
                name,
            },
            versions,
        });
    }

    Resolution { providers }
}

/// Orders version strings newest-first by semver, falling back to reverse
/// lexicographic order for ties and unparsable strings.
pub(crate) fn compare_versions_desc(a: &str, b: &str) -> std::cmp::Ordering {
    match (parse_lenient(a), parse_lenient(b)) {
        (Some((va, _)), Some((vb, _))) => vb
            .cmp_precedence(&va)
            .then_with(|| b.cmp(a)),
        _ => b.cmp(a),
    }
}
