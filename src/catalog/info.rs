// src/catalog/info.rs

//! Package descriptions combining catalog metadata with image state

use super::CatalogView;
use crate::error::{Error, Result};
use crate::fmri::{Fmri, PackageSpec};
use crate::image::ImageState;
use serde::Serialize;
use std::fmt;

/// What an image and its catalog know about one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub fmri: Fmri,
    pub installed: bool,
    /// Preferred catalog version, when newer than the installed one
    pub update: Option<Fmri>,
    pub obsolete: bool,
    /// Version pattern of a freeze on this package
    pub frozen: Option<String>,
    pub avoided: bool,
    pub dependencies: Vec<String>,
}

impl fmt::Display for PackageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "       Name: {}", self.fmri.name)?;
        writeln!(f, "    Version: {}", self.fmri.version)?;
        writeln!(
            f,
            "  Publisher: {}",
            self.fmri.publisher.as_deref().unwrap_or("-")
        )?;
        let state = match (self.installed, self.obsolete) {
            (true, _) => "Installed",
            (false, true) => "Not installed (obsolete)",
            (false, false) => "Not installed",
        };
        writeln!(f, "      State: {}", state)?;
        if let Some(update) = &self.update {
            writeln!(f, "     Update: {}", update.version)?;
        }
        if let Some(version) = &self.frozen {
            writeln!(f, "     Frozen: {}", version)?;
        }
        if self.avoided {
            writeln!(f, "    Avoided: yes")?;
        }
        for (i, dep) in self.dependencies.iter().enumerate() {
            let label = if i == 0 { "    Depends: " } else { "             " };
            writeln!(f, "{}{}", label, dep)?;
        }
        Ok(())
    }
}

impl CatalogView<'_> {
    /// Describe the package `spec` names
    ///
    /// The installed version is described when it matches `spec`, otherwise
    /// the preferred applicable catalog version.
    pub fn info(&self, state: &ImageState, spec: &PackageSpec) -> Result<PackageInfo> {
        let installed = state.installed(&spec.name).filter(|f| spec.matches(f));
        let preferred = self
            .applicable(&spec.name)
            .iter()
            .find(|entry| spec.matches(&entry.fmri));

        let fmri = match (installed, preferred) {
            (Some(fmri), _) => fmri.clone(),
            (None, Some(entry)) => entry.fmri.clone(),
            (None, None) => return Err(Error::UnknownPackage(spec.to_string())),
        };
        let update = installed.and(preferred).and_then(|entry| {
            (entry.fmri.version > fmri.version).then(|| entry.fmri.clone())
        });
        let entry = self.catalog().entry(&fmri);

        Ok(PackageInfo {
            installed: installed.is_some(),
            update,
            obsolete: entry.is_some_and(|e| e.obsolete),
            frozen: state
                .config
                .freezes
                .get(&spec.name)
                .map(|freeze| freeze.version.to_string()),
            avoided: state.config.is_avoided(&spec.name),
            dependencies: entry
                .map(|e| {
                    e.dependencies
                        .iter()
                        .map(|decl| match &decl.facet {
                            Some(facet) => format!("{} (if {})", decl.dependency, facet),
                            None => decl.dependency.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            fmri,
        })
    }
}
