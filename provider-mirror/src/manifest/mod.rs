//! Mirror manifest model: parsing, validation, defaults, and engine expansion.
//!
//! A manifest entry names a provider either as `namespace/name` or as
//! `hostname/namespace/name`. Entries without a hostname fan out to one
//! expansion per target engine, each pointed at that engine's default
//! registry; an explicit hostname suppresses the fan-out.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported IaC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Terraform,
    Opentofu,
}

impl Engine {
    /// The registry hostname consulted when the manifest names no hostname.
    pub fn default_registry(&self) -> &'static str {
        match self {
            Engine::Terraform => "registry.terraform.io",
            Engine::Opentofu => "registry.opentofu.org",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Terraform => "terraform",
            Engine::Opentofu => "opentofu",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default settings applied to providers that omit them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub engines: Vec<Engine>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// A single provider entry as written in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub versions: Vec<String>,
    /// Overrides (replaces, not merges) `defaults.engines` when non-empty.
    #[serde(default)]
    pub engines: Vec<Engine>,
    /// Overrides (replaces, not merges) `defaults.platforms` when non-empty.
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// The complete mirror manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

/// A parsed provider address. `hostname` is empty for `namespace/name`
/// sources until expansion assigns a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProviderSource {
    pub hostname: String,
    pub namespace: String,
    pub name: String,
}

impl ProviderSource {
    /// Parses `namespace/name` or `hostname/namespace/name`.
    pub fn parse(source: &str) -> Result<ProviderSource> {
        let parts: Vec<&str> = source.split('/').collect();
        match parts.as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Ok(ProviderSource {
                hostname: String::new(),
                namespace: (*namespace).to_string(),
                name: (*name).to_string(),
            }),
            [hostname, namespace, name]
                if !hostname.is_empty() && !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(ProviderSource {
                    hostname: (*hostname).to_string(),
                    namespace: (*namespace).to_string(),
                    name: (*name).to_string(),
                })
            }
            _ => Err(Error::Config(format!(
                "invalid provider source format: {source} (expected namespace/name or hostname/namespace/name)"
            ))),
        }
    }
}

impl fmt::Display for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.namespace, self.name)
    }
}

/// A provider entry expanded to a concrete registry hostname.
#[derive(Debug, Clone)]
pub struct ExpandedProvider {
    /// Source with a non-empty hostname.
    pub source: ProviderSource,
    /// Version constraints, verbatim from the manifest.
    pub constraints: Vec<String>,
    /// Resolved platform list (entry override or defaults).
    pub platforms: Vec<String>,
    /// The engine that produced this expansion; `None` when the manifest
    /// named the hostname explicitly.
    pub engine: Option<Engine>,
    /// Verbatim `source` text from the manifest, kept for provenance.
    pub source_spec: String,
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Manifest> {
        let data = std::fs::read(path).map_err(|e| Error::io("read", path, e))?;
        Manifest::parse(&data)
    }

    /// Parses manifest YAML, validates it, and applies defaults.
    pub fn parse(data: &[u8]) -> Result<Manifest> {
        let mut manifest: Manifest = serde_yaml::from_slice(data)
            .map_err(|e| Error::Config(format!("parsing manifest: {e}")))?;

        manifest.validate()?;
        manifest.apply_defaults();

        Ok(manifest)
    }

    /// Checks that the manifest is well-formed before defaults are applied.
    fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::Config(
                "manifest must specify at least one provider".to_string(),
            ));
        }

        for (i, p) in self.providers.iter().enumerate() {
            if p.source.is_empty() {
                return Err(Error::Config(format!("provider {i}: source is required")));
            }
            ProviderSource::parse(&p.source)?;
            if p.versions.is_empty() {
                return Err(Error::Config(format!(
                    "provider {}: at least one version constraint is required",
                    p.source
                )));
            }
            if p.engines.is_empty() && self.defaults.engines.is_empty() {
                return Err(Error::Config(format!(
                    "provider {}: no engines specified (set defaults.engines or provider-level engines)",
                    p.source
                )));
            }
        }

        Ok(())
    }

    /// Fills provider-level engines and platforms from defaults where unset.
    fn apply_defaults(&mut self) {
        for p in &mut self.providers {
            if p.engines.is_empty() {
                p.engines = self.defaults.engines.clone();
            }
            if p.platforms.is_empty() {
                p.platforms = self.defaults.platforms.clone();
            }
        }
    }

    /// Expands all provider entries across their configured engines.
    pub fn expanded_providers(&self) -> Result<Vec<ExpandedProvider>> {
        let mut all = Vec::new();
        for p in &self.providers {
            let expanded = expand_entry(p)
                .map_err(|e| Error::Config(format!("expanding provider {}: {e}", p.source)))?;
            all.extend(expanded);
        }
        Ok(all)
    }
}

fn expand_entry(entry: &ProviderEntry) -> Result<Vec<ExpandedProvider>> {
    let parsed = ProviderSource::parse(&entry.source)?;

    if !parsed.hostname.is_empty() {
        // Explicit hostname wins over engine expansion.
        return Ok(vec![ExpandedProvider {
            source: parsed,
            constraints: entry.versions.clone(),
            platforms: entry.platforms.clone(),
            engine: None,
            source_spec: entry.source.clone(),
        }]);
    }

    Ok(entry
        .engines
        .iter()
        .map(|engine| {
            let mut source = parsed.clone();
            source.hostname = engine.default_registry().to_string();
            ExpandedProvider {
                source,
                constraints: entry.versions.clone(),
                platforms: entry.platforms.clone(),
                engine: Some(*engine),
                source_spec: entry.source.clone(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Manifest> {
        Manifest::parse(yaml.as_bytes())
    }

    #[test]
    fn engine_default_registry() {
        assert_eq!(Engine::Terraform.default_registry(), "registry.terraform.io");
        assert_eq!(Engine::Opentofu.default_registry(), "registry.opentofu.org");
    }

    #[test]
    fn provider_source_display() {
        let source = ProviderSource {
            hostname: "registry.terraform.io".to_string(),
            namespace: "hashicorp".to_string(),
            name: "null".to_string(),
        };
        assert_eq!(source.to_string(), "registry.terraform.io/hashicorp/null");
    }

    #[test]
    fn parse_provider_source_two_parts() {
        let source = ProviderSource::parse("hashicorp/null").unwrap();
        assert_eq!(source.hostname, "");
        assert_eq!(source.namespace, "hashicorp");
        assert_eq!(source.name, "null");
    }

    #[test]
    fn parse_provider_source_three_parts() {
        let source = ProviderSource::parse("registry.opentofu.org/hashicorp/null").unwrap();
        assert_eq!(source.hostname, "registry.opentofu.org");
        assert_eq!(source.namespace, "hashicorp");
        assert_eq!(source.name, "null");
    }

    #[test]
    fn parse_provider_source_invalid() {
        assert!(ProviderSource::parse("null").is_err());
        assert!(ProviderSource::parse("a/b/c/d").is_err());
        assert!(ProviderSource::parse("").is_err());
        assert!(ProviderSource::parse("hashicorp/").is_err());
    }

    #[test]
    fn parse_valid_manifest() {
        let m = parse(
            r#"
defaults:
  engines: [terraform]
  platforms: ["linux_amd64"]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap();

        assert_eq!(m.providers.len(), 1);
        assert_eq!(m.providers[0].source, "hashicorp/null");
        assert_eq!(m.providers[0].versions, vec!["3.2.4"]);
        // Defaults applied.
        assert_eq!(m.providers[0].engines, vec![Engine::Terraform]);
        assert_eq!(m.providers[0].platforms, vec!["linux_amd64"]);
    }

    #[test]
    fn parse_multiple_engines() {
        let m = parse(
            r#"
defaults:
  engines: [terraform, opentofu]
  platforms: ["linux_amd64"]
providers:
  - source: "hashicorp/null"
    versions: ["~> 3.0"]
"#,
        )
        .unwrap();
        assert_eq!(
            m.providers[0].engines,
            vec![Engine::Terraform, Engine::Opentofu]
        );
    }

    #[test]
    fn provider_overrides_replace_defaults() {
        let m = parse(
            r#"
defaults:
  engines: [terraform, opentofu]
  platforms: ["linux_amd64", "darwin_arm64"]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
    engines: [opentofu]
    platforms: ["linux_arm64"]
"#,
        )
        .unwrap();
        // Override, not merge.
        assert_eq!(m.providers[0].engines, vec![Engine::Opentofu]);
        assert_eq!(m.providers[0].platforms, vec!["linux_arm64"]);
    }

    #[test]
    fn parse_invalid_yaml() {
        assert!(parse("providers: [notamap").is_err());
    }

    #[test]
    fn parse_unknown_engine() {
        let err = parse(
            r#"
defaults:
  engines: [pulumi]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn validate_no_providers() {
        let err = parse("defaults:\n  engines: [terraform]\n").unwrap_err();
        assert!(err.to_string().contains("at least one provider"));
    }

    #[test]
    fn validate_missing_source() {
        let err = parse(
            r#"
defaults:
  engines: [terraform]
providers:
  - versions: ["1.0.0"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("source is required"));
    }

    #[test]
    fn validate_missing_versions() {
        let err = parse(
            r#"
defaults:
  engines: [terraform]
providers:
  - source: "hashicorp/null"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("version constraint"));
    }

    #[test]
    fn validate_no_engines_anywhere() {
        let err = parse(
            r#"
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no engines specified"));
    }

    #[test]
    fn validate_engines_on_provider_only() {
        let m = parse(
            r#"
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
    engines: [terraform]
"#,
        )
        .unwrap();
        assert_eq!(m.providers[0].engines, vec![Engine::Terraform]);
    }

    #[test]
    fn expand_single_engine() {
        let m = parse(
            r#"
defaults:
  engines: [terraform]
  platforms: ["linux_amd64"]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap();

        let expanded = m.expanded_providers().unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].source.hostname, "registry.terraform.io");
        assert_eq!(expanded[0].engine, Some(Engine::Terraform));
        assert_eq!(expanded[0].source_spec, "hashicorp/null");
    }

    #[test]
    fn expand_multiple_engines() {
        let m = parse(
            r#"
defaults:
  engines: [terraform, opentofu]
  platforms: ["linux_amd64"]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap();

        let expanded = m.expanded_providers().unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].source.hostname, "registry.terraform.io");
        assert_eq!(expanded[1].source.hostname, "registry.opentofu.org");
        assert_eq!(expanded[1].engine, Some(Engine::Opentofu));
    }

    #[test]
    fn expand_explicit_hostname_suppresses_fanout() {
        let m = parse(
            r#"
defaults:
  engines: [terraform, opentofu]
  platforms: ["linux_amd64"]
providers:
  - source: "registry.opentofu.org/hashicorp/null"
    versions: ["3.2.4"]
"#,
        )
        .unwrap();

        let expanded = m.expanded_providers().unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].source.hostname, "registry.opentofu.org");
        assert_eq!(expanded[0].engine, None);
        assert_eq!(expanded[0].source_spec, "registry.opentofu.org/hashicorp/null");
    }

    #[test]
    fn expand_conservation_across_entries() {
        let m = parse(
            r#"
defaults:
  engines: [terraform, opentofu]
  platforms: ["linux_amd64"]
providers:
  - source: "hashicorp/null"
    versions: ["3.2.4"]
  - source: "registry.terraform.io/hashicorp/aws"
    versions: ["~> 5.0"]
  - source: "hashicorp/random"
    versions: ["3.6.0"]
    engines: [terraform]
"#,
        )
        .unwrap();

        // 2 (fan-out) + 1 (explicit hostname) + 1 (single engine override).
        let expanded = m.expanded_providers().unwrap();
        assert_eq!(expanded.len(), 4);
    }

    #[test]
    fn expand_preserves_constraints_and_platforms() {
        let m = parse(
            r#"
defaults:
  engines: [terraform]
providers:
  - source: "hashicorp/null"
    versions: ["~> 3.0", "!= 3.1.0"]
    platforms: ["linux_amd64", "darwin_arm64"]
"#,
        )
        .unwrap();

        let expanded = m.expanded_providers().unwrap();
        assert_eq!(expanded[0].constraints, vec!["~> 3.0", "!= 3.1.0"]);
        assert_eq!(expanded[0].platforms, vec!["linux_amd64", "darwin_arm64"]);
    }

    #[test]
    fn load_file_not_found() {
        let err = Manifest::load(Path::new("/nonexistent/mirror.yaml")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn load_valid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mirror.yaml");
        std::fs::write(
            &path,
            "defaults:\n  engines: [terraform]\nproviders:\n  - source: hashicorp/null\n    versions: [\"3.2.4\"]\n",
        )
        .unwrap();

        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.providers.len(), 1);
    }
}
