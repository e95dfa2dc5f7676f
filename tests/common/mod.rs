// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use imagepkg::plan::{ContentAction, ManifestAction};
use imagepkg::{
    Catalog, CatalogFeed, CatalogView, ContentFetcher, Fmri, Image, ImageConfig, ImageState,
    MemoryFeed, MemoryManifests, Result, Solution, SolveRequest, Solver,
};
use tempfile::TempDir;

pub fn fmri(s: &str) -> Fmri {
    Fmri::parse(s).unwrap()
}

/// Build a catalog for one publisher from JSON-lines records
pub fn catalog(publisher: &str, records: &[&str]) -> Catalog {
    let mut feed = MemoryFeed::new(publisher);
    for record in records {
        feed.push_json(record).unwrap();
    }
    let feeds: Vec<Box<dyn CatalogFeed>> = vec![Box::new(feed)];
    Catalog::load(&feeds, false).unwrap()
}

pub fn installed(fmris: &[&str]) -> ImageState {
    let mut state = ImageState::default();
    for f in fmris {
        state.install(fmri(f));
    }
    state
}

pub fn solve(catalog: &Catalog, state: &ImageState, request: &SolveRequest) -> Result<Solution> {
    solve_with(catalog, state, &state.config, request)
}

pub fn solve_with(
    catalog: &Catalog,
    state: &ImageState,
    config: &ImageConfig,
    request: &SolveRequest,
) -> Result<Solution> {
    let view = CatalogView::new(catalog, config);
    let solution = Solver::new(&view, state).solve(request)?;
    solution.verify(&view, state)?;
    Ok(solution)
}

/// Selected packages as `name@version` strings
pub fn selected(solution: &Solution) -> Vec<String> {
    solution
        .selected()
        .map(|f| format!("{}@{}", f.name, f.version))
        .collect()
}

pub fn dir(path: &str) -> ManifestAction {
    ManifestAction::new(ContentAction::Dir {
        path: path.to_string(),
        mode: 0o755,
        owner: "root".to_string(),
        group: "root".to_string(),
    })
}

pub fn file(path: &str, hash: &str) -> ManifestAction {
    ManifestAction::new(ContentAction::File {
        path: path.to_string(),
        hash: hash.to_string(),
        mode: 0o644,
        owner: "root".to_string(),
        group: "root".to_string(),
        overlay: None,
        actuators: Vec::new(),
    })
}

pub fn link(path: &str, target: &str) -> ManifestAction {
    ManifestAction::new(ContentAction::Link {
        path: path.to_string(),
        target: target.to_string(),
    })
}

pub fn manifests(entries: Vec<(&str, Vec<ManifestAction>)>) -> MemoryManifests {
    let mut manifests = MemoryManifests::new();
    for (f, actions) in entries {
        manifests.insert(fmri(f), actions);
    }
    manifests
}

/// Fetcher that always succeeds
pub struct Fetched;

impl ContentFetcher for Fetched {
    fn fetch(&self, _owner: &Fmri, _action: &ContentAction) -> Result<()> {
        Ok(())
    }
}

/// Create an image in a fresh temporary directory
///
/// Returns (TempDir, Image) - keep the TempDir alive to prevent cleanup.
pub fn temp_image() -> (TempDir, Image) {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = Image::create(temp_dir.path()).unwrap();
    (temp_dir, image)
}

/// Create an image with `fmris` already recorded as installed
pub fn temp_image_with(fmris: &[&str]) -> (TempDir, Image) {
    let (temp_dir, mut image) = temp_image();
    image.save_state(&installed(fmris)).unwrap();
    (temp_dir, image)
}
