// src/plan/listing.rs

//! Variant and facet listings
//!
//! An image's settings are the ones in its configuration plus those its
//! installed packages refer to without the image setting them.

use super::Planner;
use crate::error::Result;
use crate::image::ImageState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Setting {
    pub name: String,
    /// `None` for a variant the image leaves unset
    pub value: Option<String>,
    /// Set in the image configuration rather than implied by content
    pub explicit: bool,
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}",
            self.name,
            self.value.as_deref().unwrap_or("-"),
            if self.explicit { "set" } else { "implicit" }
        )
    }
}

impl Planner<'_> {
    /// Variants set in the image or declared by installed packages
    pub fn variants(&self, state: &ImageState) -> Vec<Setting> {
        let mut settings: BTreeMap<String, Setting> = BTreeMap::new();
        for fmri in state.installed.values() {
            let Some(entry) = self.catalog.entry(fmri) else {
                continue;
            };
            for name in entry.variants.keys() {
                settings.entry(name.clone()).or_insert_with(|| Setting {
                    name: name.clone(),
                    value: state.config.variant(name).map(str::to_string),
                    explicit: false,
                });
            }
        }
        for (name, value) in &state.config.variants {
            settings.insert(
                name.clone(),
                Setting {
                    name: name.clone(),
                    value: Some(value.clone()),
                    explicit: true,
                },
            );
        }
        settings.into_values().collect()
    }

    /// Facets set in the image or referenced by installed content and
    /// dependencies, with their effective values
    pub fn facets(&self, state: &ImageState) -> Result<Vec<Setting>> {
        let mut names = Vec::new();
        for fmri in state.installed.values() {
            if let Some(entry) = self.catalog.entry(fmri) {
                names.extend(entry.dependencies.iter().filter_map(|d| d.facet.clone()));
            }
            for line in self.manifests.manifest(fmri)? {
                names.extend(line.tags.facets);
            }
        }

        let mut settings: BTreeMap<String, Setting> = BTreeMap::new();
        for name in names {
            let value = state.config.facet_enabled(&name).to_string();
            settings.entry(name.clone()).or_insert(Setting {
                name,
                value: Some(value),
                explicit: false,
            });
        }
        for (name, value) in &state.config.facets {
            settings.insert(
                name.clone(),
                Setting {
                    name: name.clone(),
                    value: Some(value.to_string()),
                    explicit: true,
                },
            );
        }
        Ok(settings.into_values().collect())
    }
}
