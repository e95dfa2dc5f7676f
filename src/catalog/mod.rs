// src/catalog/mod.rs

//! Package catalog
//!
//! The catalog indexes every package version known from the configured
//! feeds, grouped by publisher and by name, together with its declared
//! dependencies, variant tags and mediator claims. It is built in one bulk
//! load and never changes afterwards; a fresh catalog replaces it between
//! operations.
//!
//! [`CatalogView`] narrows the catalog to one image: entries whose variant
//! tags contradict the image are dropped and the remaining candidates for
//! each name are ordered by preference.

pub mod dependency;
pub mod feed;
mod info;

pub use dependency::{
    Dependency, DependencyDecl, DependencyKind, MediatorClaim, PARENT_SELF, Predicate, Target,
};
pub use feed::{CatalogFeed, FileFeed, MemoryFeed, RawEntry};
pub use info::PackageInfo;

use crate::error::Result;
use crate::fmri::{Fmri, Version};
use crate::image::ImageConfig;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A package version with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub fmri: Fmri,
    pub dependencies: Vec<DependencyDecl>,
    /// Variant name → values this entry applies to
    pub variants: BTreeMap<String, BTreeSet<String>>,
    pub mediations: Vec<MediatorClaim>,
    pub obsolete: bool,
}

impl CatalogEntry {
    /// Entry with no metadata beyond its identity
    pub fn bare(fmri: Fmri) -> Self {
        Self {
            fmri,
            dependencies: Vec::new(),
            variants: BTreeMap::new(),
            mediations: Vec::new(),
            obsolete: false,
        }
    }

    /// True unless a variant tag excludes the image's active value
    pub fn applies_to(&self, variants: &BTreeMap<String, String>) -> bool {
        self.variants.iter().all(|(name, allowed)| {
            variants
                .get(name)
                .is_none_or(|active| allowed.contains(active))
        })
    }
}

/// Outcome counters of a catalog load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub anomalies: Vec<String>,
}

/// Indexed, read-only package catalog
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// publisher → name → version → entry
    publishers: BTreeMap<String, BTreeMap<String, BTreeMap<Version, Arc<CatalogEntry>>>>,
    /// name → every entry across publishers, sorted by FMRI
    by_name: BTreeMap<String, Vec<Arc<CatalogEntry>>>,
    report: LoadReport,
}

/// Entries decoded from one feed, before merging
struct FeedBatch {
    publisher: String,
    entries: Vec<CatalogEntry>,
    anomalies: Vec<String>,
}

fn decode_feed(feed: &dyn CatalogFeed, parallel: bool) -> Result<FeedBatch> {
    let publisher = feed.publisher().to_string();
    let raw = feed.entries()?;

    let convert = |item: std::result::Result<RawEntry, String>| match item {
        Ok(raw) => {
            let label = raw.fmri.clone();
            raw.into_entry(&publisher)
                .map_err(|e| format!("{}: {}", label, e))
        }
        Err(reason) => Err(reason),
    };

    let results: Vec<_> = if parallel {
        raw.into_par_iter().map(convert).collect()
    } else {
        raw.into_iter().map(convert).collect()
    };

    let mut entries = Vec::new();
    let mut anomalies = Vec::new();
    for result in results {
        match result {
            Ok(entry) => entries.push(entry),
            Err(reason) => anomalies.push(format!("[{}] {}", publisher, reason)),
        }
    }

    Ok(FeedBatch {
        publisher,
        entries,
        anomalies,
    })
}

impl Catalog {
    /// Load and index every feed
    ///
    /// Feeds are decoded concurrently when `parallel` is set; the merge is in
    /// publisher then FMRI order so the result does not depend on scheduling.
    /// Malformed records are skipped and counted. A feed that cannot be read
    /// at all fails the load with `TransportFailure`.
    pub fn load(feeds: &[Box<dyn CatalogFeed>], parallel: bool) -> Result<Self> {
        let batches: Vec<FeedBatch> = if parallel {
            feeds
                .par_iter()
                .map(|f| decode_feed(f.as_ref(), true))
                .collect::<Result<Vec<_>>>()?
        } else {
            feeds
                .iter()
                .map(|f| decode_feed(f.as_ref(), false))
                .collect::<Result<Vec<_>>>()?
        };

        let mut batches = batches;
        batches.sort_by(|a, b| a.publisher.cmp(&b.publisher));

        let mut catalog = Catalog::default();
        for batch in batches {
            for anomaly in batch.anomalies {
                warn!("Skipping catalog entry {}", anomaly);
                catalog.report.skipped += 1;
                catalog.report.anomalies.push(anomaly);
            }
            let mut entries = batch.entries;
            entries.sort_by(|a, b| a.fmri.cmp(&b.fmri));
            for entry in entries {
                catalog.insert(entry);
            }
        }

        info!(
            "Catalog loaded: {} entries, {} skipped, {} duplicates",
            catalog.report.loaded, catalog.report.skipped, catalog.report.duplicates
        );
        Ok(catalog)
    }

    /// Build a catalog directly from typed entries
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut entries: Vec<CatalogEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.fmri.cmp(&b.fmri));
        let mut catalog = Catalog::default();
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    fn insert(&mut self, entry: CatalogEntry) {
        let publisher = entry.fmri.publisher.clone().unwrap_or_default();
        let versions = self
            .publishers
            .entry(publisher)
            .or_default()
            .entry(entry.fmri.name.clone())
            .or_default();

        if versions.contains_key(&entry.fmri.version) {
            debug!("Duplicate catalog entry {}", entry.fmri);
            self.report.duplicates += 1;
            return;
        }

        let entry = Arc::new(entry);
        versions.insert(entry.fmri.version.clone(), Arc::clone(&entry));

        let list = self.by_name.entry(entry.fmri.name.clone()).or_default();
        let pos = list
            .binary_search_by(|e| e.fmri.cmp(&entry.fmri))
            .unwrap_or_else(|p| p);
        list.insert(pos, entry);
        self.report.loaded += 1;
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Known publishers, sorted
    pub fn publishers(&self) -> impl Iterator<Item = &str> {
        self.publishers.keys().map(String::as_str)
    }

    /// All package names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Every entry for `name`, across publishers, sorted by FMRI
    pub fn versions(&self, name: &str) -> &[Arc<CatalogEntry>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries for `name` from one publisher, oldest first
    pub fn publisher_versions(&self, publisher: &str, name: &str) -> Vec<&Arc<CatalogEntry>> {
        self.publishers
            .get(publisher)
            .and_then(|names| names.get(name))
            .map(|versions| versions.values().collect())
            .unwrap_or_default()
    }

    /// Look up the entry for an exact FMRI
    ///
    /// An FMRI without a publisher matches the first publisher (in sorted
    /// order) carrying that name and version.
    pub fn entry(&self, fmri: &Fmri) -> Option<&Arc<CatalogEntry>> {
        match fmri.publisher {
            Some(ref p) => self
                .publishers
                .get(p)
                .and_then(|names| names.get(&fmri.name))
                .and_then(|versions| versions.get(&fmri.version)),
            None => self
                .versions(&fmri.name)
                .iter()
                .find(|e| e.fmri.version == fmri.version),
        }
    }

    pub fn len(&self) -> usize {
        self.report.loaded
    }

    pub fn is_empty(&self) -> bool {
        self.report.loaded == 0
    }
}

/// The catalog as seen from one image
///
/// Candidates for a name are ordered newest version first, then by the
/// image's publisher search order, then by FMRI string.
pub struct CatalogView<'a> {
    catalog: &'a Catalog,
    config: &'a ImageConfig,
    candidates: BTreeMap<&'a str, Vec<Arc<CatalogEntry>>>,
}

impl<'a> CatalogView<'a> {
    pub fn new(catalog: &'a Catalog, config: &'a ImageConfig) -> Self {
        let mut candidates = BTreeMap::new();
        for (name, entries) in &catalog.by_name {
            let mut applicable: Vec<Arc<CatalogEntry>> = entries
                .iter()
                .filter(|e| e.applies_to(&config.variants))
                .cloned()
                .collect();
            applicable.sort_by(|a, b| preference(config, &a.fmri, &b.fmri));
            candidates.insert(name.as_str(), applicable);
        }
        Self {
            catalog,
            config,
            candidates,
        }
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    pub fn config(&self) -> &'a ImageConfig {
        self.config
    }

    /// Automatic candidates for `name` in preference order (never obsolete)
    pub fn candidates(&self, name: &str) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.applicable(name).iter().filter(|e| !e.obsolete)
    }

    /// Every applicable entry for `name`, obsolete ones included
    pub fn applicable(&self, name: &str) -> &[Arc<CatalogEntry>] {
        self.candidates.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names with at least one applicable entry
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.candidates
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.candidates.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Declared dependencies of `fmri`, if the catalog knows it
    pub fn dependencies(&self, fmri: &Fmri) -> Option<&[DependencyDecl]> {
        self.catalog
            .entry(fmri)
            .map(|e| e.dependencies.as_slice())
    }
}

/// Candidate order: newest first, then publisher rank, then FMRI string
pub(crate) fn preference(config: &ImageConfig, a: &Fmri, b: &Fmri) -> Ordering {
    b.version
        .cmp(&a.version)
        .then_with(|| {
            config
                .publisher_rank(a.publisher.as_deref())
                .cmp(&config.publisher_rank(b.publisher.as_deref()))
        })
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct BrokenFeed;

    impl CatalogFeed for BrokenFeed {
        fn publisher(&self) -> &str {
            "broken"
        }

        fn entries(&self) -> Result<Vec<std::result::Result<RawEntry, String>>> {
            Err(Error::TransportFailure {
                what: "catalog broken".to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    fn feed(publisher: &str, lines: &[&str]) -> Box<dyn CatalogFeed> {
        let mut f = MemoryFeed::new(publisher);
        for line in lines {
            f.push_json(line).unwrap();
        }
        Box::new(f)
    }

    #[test]
    fn test_load_skips_malformed() {
        let feeds = vec![feed(
            "test",
            &[
                r#"{"fmri": "a@1.0"}"#,
                r#"{"fmri": "a@"}"#,
                r#"{"fmri": "b@1.0", "depends": [{"type": "bogus", "fmri": "a"}]}"#,
                r#"{"fmri": "c@2.0"}"#,
            ],
        )];
        let catalog = Catalog::load(&feeds, true).unwrap();
        assert_eq!(catalog.report().loaded, 2);
        assert_eq!(catalog.report().skipped, 2);
        assert_eq!(catalog.report().anomalies.len(), 2);
        assert!(catalog.contains_name("a"));
        assert!(!catalog.contains_name("b"));
    }

    #[test]
    fn test_load_counts_duplicates() {
        let feeds = vec![feed(
            "test",
            &[r#"{"fmri": "a@1.0"}"#, r#"{"fmri": "pkg://test/a@1.0"}"#],
        )];
        let catalog = Catalog::load(&feeds, false).unwrap();
        assert_eq!(catalog.report().loaded, 1);
        assert_eq!(catalog.report().duplicates, 1);
    }

    #[test]
    fn test_load_is_order_independent() {
        let one = || feed("alpha", &[r#"{"fmri": "a@1.0"}"#, r#"{"fmri": "b@1.0"}"#]);
        let two = || feed("beta", &[r#"{"fmri": "a@1.0"}"#, r#"{"fmri": "a@2.0"}"#]);

        let forward = Catalog::load(&[one(), two()], true).unwrap();
        let backward = Catalog::load(&[two(), one()], true).unwrap();

        let fmris = |c: &Catalog| -> Vec<String> {
            c.names()
                .flat_map(|n| c.versions(n).iter().map(|e| e.fmri.to_string()))
                .collect()
        };
        assert_eq!(fmris(&forward), fmris(&backward));
        assert_eq!(forward.versions("a").len(), 3);
        assert_eq!(forward.publishers().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(forward.publisher_versions("beta", "a").len(), 2);
    }

    #[test]
    fn test_failing_feed_is_transport_failure() {
        let feeds: Vec<Box<dyn CatalogFeed>> = vec![feed("ok", &[]), Box::new(BrokenFeed)];
        let err = Catalog::load(&feeds, true).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_view_filters_variants() {
        let feeds = vec![feed(
            "test",
            &[
                r#"{"fmri": "a@1.0", "variants": {"variant.arch": ["sparc"]}}"#,
                r#"{"fmri": "a@0.9", "variants": {"variant.arch": ["i386", "sparc"]}}"#,
            ],
        )];
        let catalog = Catalog::load(&feeds, false).unwrap();

        let mut config = ImageConfig::default();
        config
            .variants
            .insert("variant.arch".to_string(), "i386".to_string());
        let view = CatalogView::new(&catalog, &config);

        let versions: Vec<String> = view
            .candidates("a")
            .map(|e| e.fmri.version.to_string())
            .collect();
        assert_eq!(versions, vec!["0.9"]);
    }

    #[test]
    fn test_view_publisher_order() {
        let feeds = vec![
            feed("alpha", &[r#"{"fmri": "a@1.0"}"#]),
            feed("beta", &[r#"{"fmri": "a@1.0"}"#, r#"{"fmri": "a@0.5"}"#]),
        ];
        let catalog = Catalog::load(&feeds, false).unwrap();

        let mut config = ImageConfig::default();
        config.publishers = vec!["beta".to_string(), "alpha".to_string()];
        let view = CatalogView::new(&catalog, &config);

        let order: Vec<String> = view.candidates("a").map(|e| e.fmri.to_string()).collect();
        assert_eq!(
            order,
            vec!["pkg://beta/a@1.0", "pkg://alpha/a@1.0", "pkg://beta/a@0.5"]
        );
    }

    #[test]
    fn test_view_hides_obsolete() {
        let feeds = vec![feed(
            "test",
            &[
                r#"{"fmri": "a@1.0"}"#,
                r#"{"fmri": "a@2.0", "obsolete": true}"#,
            ],
        )];
        let catalog = Catalog::load(&feeds, false).unwrap();
        let config = ImageConfig::default();
        let view = CatalogView::new(&catalog, &config);
        assert_eq!(view.candidates("a").count(), 1);
        assert_eq!(view.applicable("a").len(), 2);
    }

    #[test]
    fn test_entry_lookup_without_publisher() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::bare(
            Fmri::parse("pkg://test/a@1.0").unwrap(),
        )]);
        assert!(catalog.entry(&Fmri::parse("a@1.0").unwrap()).is_some());
        assert!(catalog.entry(&Fmri::parse("pkg://other/a@1.0").unwrap()).is_none());
    }
}
