// src/image/config.rs

//! Image-scoped configuration
//!
//! Variants, facets, mediators, publisher search order, freezes and the avoid
//! list. Every collection is an ordered map so the persisted form and every
//! iteration over it are deterministic.

use crate::error::{Error, Result};
use crate::fmri::{Fmri, PackageSpec, Version, VersionRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A freeze pins a package to versions matching `version` (prefix match)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freeze {
    pub version: Version,
    pub reason: Option<String>,
    pub frozen_at: DateTime<Utc>,
}

/// Explicit mediator selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatorSetting {
    pub version: Option<Version>,
    pub implementation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Active value per variant (`variant.arch` → `i386`)
    pub variants: BTreeMap<String, String>,
    /// Facet patterns; a trailing `*` matches any suffix
    pub facets: BTreeMap<String, bool>,
    pub mediators: BTreeMap<String, MediatorSetting>,
    /// Publisher search order, highest priority first
    pub publishers: Vec<String>,
    pub freezes: BTreeMap<String, Freeze>,
    pub avoid: BTreeSet<String>,
}

impl ImageConfig {
    pub fn variant(&self, name: &str) -> Option<&str> {
        self.variants.get(name).map(String::as_str)
    }

    /// Facet state; unset facets are enabled
    ///
    /// An exact entry wins, otherwise the longest matching wildcard pattern.
    pub fn facet_enabled(&self, name: &str) -> bool {
        if let Some(&value) = self.facets.get(name) {
            return value;
        }

        self.facets
            .iter()
            .filter_map(|(pattern, &value)| {
                let prefix = pattern.strip_suffix('*')?;
                name.starts_with(prefix).then_some((prefix.len(), value))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, value)| value)
            .unwrap_or(true)
    }

    /// Position in the search order; unlisted publishers rank last
    pub fn publisher_rank(&self, publisher: Option<&str>) -> usize {
        publisher
            .and_then(|p| self.publishers.iter().position(|q| q == p))
            .unwrap_or(self.publishers.len())
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.freezes.contains_key(name)
    }

    pub fn is_avoided(&self, name: &str) -> bool {
        self.avoid.contains(name)
    }

    /// Freeze a package
    ///
    /// Without a version in `spec` the installed version is used. Only a
    /// bare version (prefix) or an exact version can be frozen.
    pub fn freeze(
        &mut self,
        spec: &PackageSpec,
        installed: Option<&Fmri>,
        reason: Option<&str>,
    ) -> Result<()> {
        let version = match (&spec.range, installed) {
            (VersionRange::Any, Some(fmri)) => fmri.version.clone(),
            (VersionRange::Any, None) => return Err(Error::NotInstalled(spec.name.clone())),
            (VersionRange::Prefix(v), _) | (VersionRange::Exact(v), _) => v.clone(),
            (other, _) => {
                return Err(Error::InvalidOperation(format!(
                    "cannot freeze {} to range {}; give a version",
                    spec.name, other
                )));
            }
        };

        info!("Freezing {} at {}", spec.name, version);
        self.freezes.insert(
            spec.name.clone(),
            Freeze {
                version,
                reason: reason.map(str::to_string),
                frozen_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn unfreeze(&mut self, name: &str) -> Result<Freeze> {
        self.freezes
            .remove(name)
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not frozen", name)))
    }

    pub fn avoid(&mut self, name: &str) {
        self.avoid.insert(name.to_string());
    }

    pub fn unavoid(&mut self, name: &str) -> Result<()> {
        if self.avoid.remove(name) {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!("{} is not avoided", name)))
        }
    }

    /// Set a variant; names must carry the `variant.` prefix
    pub fn set_variant(&mut self, name: &str, value: &str) -> Result<()> {
        if !name.starts_with("variant.") || value.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "invalid variant assignment {}={}",
                name, value
            )));
        }
        self.variants.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Set a facet pattern, or reset it to the default with `None`
    pub fn set_facet(&mut self, name: &str, value: Option<bool>) -> Result<()> {
        if !name.starts_with("facet.") {
            return Err(Error::InvalidOperation(format!(
                "facet name '{}' must start with 'facet.'",
                name
            )));
        }
        match value {
            Some(v) => {
                self.facets.insert(name.to_string(), v);
            }
            None => {
                self.facets.remove(name);
            }
        }
        Ok(())
    }

    pub fn set_mediator(&mut self, name: &str, setting: MediatorSetting) -> Result<()> {
        if setting.version.is_none() && setting.implementation.is_none() {
            return Err(Error::InvalidOperation(format!(
                "mediator {} needs a version or an implementation",
                name
            )));
        }
        self.mediators.insert(name.to_string(), setting);
        Ok(())
    }

    pub fn unset_mediator(&mut self, name: &str) -> Result<()> {
        self.mediators
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidOperation(format!("mediator {} is not set", name)))
    }

    pub fn set_publishers(&mut self, publishers: Vec<String>) -> Result<()> {
        let unique: BTreeSet<&String> = publishers.iter().collect();
        if unique.len() != publishers.len() {
            return Err(Error::InvalidOperation(
                "publisher search order lists a publisher twice".to_string(),
            ));
        }
        self.publishers = publishers;
        Ok(())
    }

    /// Variants whose value differs in `target` (name, old, new)
    pub fn variant_changes(
        &self,
        target: &ImageConfig,
    ) -> Vec<(String, Option<String>, Option<String>)> {
        diff_maps(&self.variants, &target.variants)
    }

    /// Facets whose setting differs in `target` (name, old, new)
    pub fn facet_changes(&self, target: &ImageConfig) -> Vec<(String, Option<bool>, Option<bool>)> {
        diff_maps(&self.facets, &target.facets)
    }
}

fn diff_maps<V: Clone + PartialEq>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
) -> Vec<(String, Option<V>, Option<V>)> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            let (a, b) = (old.get(k), new.get(k));
            (a != b).then(|| (k.clone(), a.cloned(), b.cloned()))
        })
        .collect()
}
