// tests/linked.rs

//! Parent/child operations through the coordinator, on images in temp dirs.

mod common;

use common::{Fetched, catalog, dir, file, fmri, manifests, temp_image_with};
use imagepkg::linked::{DiskImages, LockSet};
use imagepkg::transaction::recover_all;
use imagepkg::{
    ActionExecutor, Catalog, CatalogView, ChildRelation, ChildState, Coordinator, Error, Image,
    ImagePlan, LinkPolicy, MemoryManifests, MetadataOnly, PackageSpec, PlannedAction, Planner,
    RecoveryOutcome, SolveRequest, Solver, paths,
};
use std::path::Path;
use tempfile::TempDir;

struct Refuse;

impl ActionExecutor for Refuse {
    fn apply(&mut self, action: &PlannedAction) -> imagepkg::Result<()> {
        Err(Error::Io(std::io::Error::other(format!(
            "read-only filesystem at {}",
            action.key
        ))))
    }
}

/// libc 1.0 → 2.0; `web` incorporates whichever libc it was built against
fn fixture() -> (Catalog, MemoryManifests) {
    let catalog = catalog(
        "test",
        &[
            r#"{"fmri": "libc@1.0"}"#,
            r#"{"fmri": "libc@2.0"}"#,
            r#"{"fmri": "web@1.0", "depends": [{"type": "incorporate", "fmri": "libc@1"}]}"#,
            r#"{"fmri": "tools@1.0", "depends": [{"type": "require", "fmri": "libc"}]}"#,
        ],
    );
    let manifests = manifests(vec![
        ("pkg://test/libc@1.0", vec![dir("lib"), file("lib/libc.so", "one")]),
        ("pkg://test/libc@2.0", vec![dir("lib"), file("lib/libc.so", "two")]),
        ("pkg://test/web@1.0", vec![file("srv/web", "web")]),
        ("pkg://test/tools@1.0", vec![file("bin/tools", "tools")]),
    ]);
    (catalog, manifests)
}

fn parent_update(catalog: &Catalog, manifests: &MemoryManifests, image: &Image) -> ImagePlan {
    let state = image.load_state().unwrap();
    let view = CatalogView::new(catalog, &state.config);
    let solution = Solver::new(&view, &state)
        .solve(&SolveRequest::new().update(PackageSpec::name("libc")))
        .unwrap();
    Planner::new(catalog, manifests)
        .evaluate(&state, &state.config, &solution)
        .unwrap()
}

fn attach(parent: &Image, name: &str, child: &TempDir, policy: LinkPolicy) -> ChildRelation {
    let relation = ChildRelation::new(name, child.path(), policy);
    parent.attach_child(&relation).unwrap();
    relation
}

#[test]
fn test_child_follows_parent_update() {
    let (catalog, manifests) = fixture();
    let (_parent_dir, mut parent) = temp_image_with(&["pkg://test/libc@1.0"]);
    let (child_dir, _child) =
        temp_image_with(&["pkg://test/libc@1.0", "pkg://test/tools@1.0"]);
    let (other_dir, _other) = temp_image_with(&["pkg://test/tools@1.0"]);
    attach(&parent, "zone1", &child_dir, LinkPolicy::Recurse);
    attach(&parent, "zone2", &other_dir, LinkPolicy::Exclude);

    let children = parent.children().unwrap();
    let _locks = LockSet::acquire(parent.root(), &children, 0).unwrap();

    let coordinator = Coordinator::new(&catalog, &manifests);
    let mut linked = coordinator
        .plan(parent_update(&catalog, &manifests, &parent), &children, &DiskImages)
        .unwrap();
    assert_eq!(linked.children.len(), 1);
    assert_eq!(linked.children[0].relation.name, "zone1");
    assert_eq!(
        linked.children[0].plan.summary().update,
        vec![(fmri("pkg://test/libc@1.0"), fmri("pkg://test/libc@2.0"))]
    );

    linked.prepare(&Fetched).unwrap();
    let mut executors = |_root: &Path| -> Box<dyn ActionExecutor> { Box::new(MetadataOnly::new()) };
    coordinator
        .execute(&mut parent, &mut linked, &mut executors)
        .unwrap();

    let libc2 = fmri("pkg://test/libc@2.0");
    assert_eq!(parent.load_state().unwrap().installed("libc"), Some(&libc2));
    let child_state = Image::open(child_dir.path()).unwrap().load_state().unwrap();
    assert_eq!(child_state.installed("libc"), Some(&libc2));
    assert!(child_state.is_installed("tools"));

    let relations = parent.children().unwrap();
    let zone1 = relations.iter().find(|c| c.name == "zone1").unwrap();
    assert_eq!(zone1.state, ChildState::Synced);
    let zone2 = relations.iter().find(|c| c.name == "zone2").unwrap();
    assert_eq!(zone2.state, ChildState::Attached);
}

#[test]
fn test_recurse_child_that_cannot_follow_blocks_parent() {
    let (catalog, manifests) = fixture();
    let (_parent_dir, parent) = temp_image_with(&["pkg://test/libc@1.0"]);
    let (child_dir, _child) = temp_image_with(&["pkg://test/libc@1.0", "pkg://test/web@1.0"]);
    attach(&parent, "web-zone", &child_dir, LinkPolicy::Recurse);

    let coordinator = Coordinator::new(&catalog, &manifests);
    let err = coordinator
        .plan(
            parent_update(&catalog, &manifests, &parent),
            &parent.children().unwrap(),
            &DiskImages,
        )
        .unwrap_err();
    match err {
        Error::SyncFailed { child, reason } => {
            assert_eq!(child, "web-zone");
            assert!(reason.contains("libc"), "{}", reason);
        }
        other => panic!("expected sync failure, got {:?}", other),
    }
}

#[test]
fn test_ignore_child_is_skipped() {
    let (catalog, manifests) = fixture();
    let (_parent_dir, parent) = temp_image_with(&["pkg://test/libc@1.0"]);
    let (child_dir, _child) = temp_image_with(&["pkg://test/libc@1.0", "pkg://test/web@1.0"]);
    attach(&parent, "web-zone", &child_dir, LinkPolicy::Ignore);

    let coordinator = Coordinator::new(&catalog, &manifests);
    let linked = coordinator
        .plan(
            parent_update(&catalog, &manifests, &parent),
            &parent.children().unwrap(),
            &DiskImages,
        )
        .unwrap();
    assert!(linked.children.is_empty());
    assert_eq!(linked.skipped.len(), 1);
    assert_eq!(linked.skipped[0].0.name, "web-zone");
    assert!(!linked.parent.is_empty());
}

#[test]
fn test_failed_child_execution_commits_nothing() {
    let (catalog, manifests) = fixture();
    let (_parent_dir, mut parent) = temp_image_with(&["pkg://test/libc@1.0"]);
    let (child_dir, mut child) = temp_image_with(&["pkg://test/libc@1.0"]);
    attach(&parent, "zone1", &child_dir, LinkPolicy::Recurse);

    let coordinator = Coordinator::new(&catalog, &manifests);
    let mut linked = coordinator
        .plan(
            parent_update(&catalog, &manifests, &parent),
            &parent.children().unwrap(),
            &DiskImages,
        )
        .unwrap();
    linked.prepare(&Fetched).unwrap();

    let child_root = child_dir.path().to_path_buf();
    let mut executors = |root: &Path| -> Box<dyn ActionExecutor> {
        if root == child_root {
            Box::new(Refuse)
        } else {
            Box::new(MetadataOnly::new())
        }
    };
    let err = coordinator
        .execute(&mut parent, &mut linked, &mut executors)
        .unwrap_err();
    assert!(matches!(err, Error::SyncFailed { ref child, .. } if child == "zone1"));

    // neither image recorded the new libc
    let libc1 = fmri("pkg://test/libc@1.0");
    assert_eq!(parent.load_state().unwrap().installed("libc"), Some(&libc1));
    assert_eq!(child.load_state().unwrap().installed("libc"), Some(&libc1));
    assert_eq!(parent.children().unwrap()[0].state, ChildState::SyncFailed);

    // the parent applied everything but never saw the commit decision
    let outcomes = recover_all(&mut parent).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0], RecoveryOutcome::NeedsRepair(s) if s.fully_applied()));
    assert_eq!(parent.load_state().unwrap().installed("libc"), Some(&libc1));

    let outcomes = recover_all(&mut child).unwrap();
    assert!(matches!(&outcomes[0], RecoveryOutcome::NeedsRepair(s) if s.applied.is_empty()));
}

#[test]
fn test_linked_commit_shares_one_operation() {
    let (catalog, manifests) = fixture();
    let (parent_dir, mut parent) = temp_image_with(&["pkg://test/libc@1.0"]);
    let (child_dir, _child) = temp_image_with(&["pkg://test/libc@1.0"]);
    attach(&parent, "zone1", &child_dir, LinkPolicy::Ignore);

    let coordinator = Coordinator::new(&catalog, &manifests);
    let mut linked = coordinator
        .plan(
            parent_update(&catalog, &manifests, &parent),
            &parent.children().unwrap(),
            &DiskImages,
        )
        .unwrap();
    linked.prepare(&Fetched).unwrap();
    let mut executors = |_root: &Path| -> Box<dyn ActionExecutor> { Box::new(MetadataOnly::new()) };
    coordinator
        .execute(&mut parent, &mut linked, &mut executors)
        .unwrap();

    let archived = |root: &Path| -> Vec<String> {
        std::fs::read_dir(paths::journal_archive_dir(root))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    };
    let parent_journals = archived(parent_dir.path());
    assert_eq!(parent_journals.len(), 1);
    assert_eq!(archived(child_dir.path()), parent_journals);
    assert_eq!(parent.children().unwrap()[0].state, ChildState::Synced);
}

#[test]
fn test_locked_child_blocks_operation() {
    let (_parent_dir, parent) = temp_image_with(&[]);
    let (child_dir, child) = temp_image_with(&[]);
    attach(&parent, "zone1", &child_dir, LinkPolicy::Recurse);

    let _busy = child.lock_exclusive(0).unwrap();
    let err = LockSet::acquire(parent.root(), &parent.children().unwrap(), 0).unwrap_err();
    assert!(matches!(err, Error::LockContention { .. }));

    // the parent lock was released on failure
    let _again = parent.lock_exclusive(0).unwrap();
}
