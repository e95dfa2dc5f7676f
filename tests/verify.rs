// tests/verify.rs

//! Inspecting installed images: verify and repair, contents, settings and
//! history.

mod common;

use common::{Fetched, catalog, dir, file, fmri, installed, link, manifests, temp_image_with};
use imagepkg::hash::{HashAlgorithm, hash_bytes};
use imagepkg::transaction::{HistoryOutcome, history};
use imagepkg::{
    ActionOp, Catalog, Error, Finding, MemoryManifests, MetadataOnly,
    PlannedAction, Planner, Transaction, TransactionOptions,
};
use std::fs;
use std::path::Path;

fn sha256(content: &str) -> String {
    hash_bytes(HashAlgorithm::Sha256, content.as_bytes())
        .as_hex()
        .to_string()
}

/// `app` delivers a directory, a checked file, a link and a file whose
/// payload reference is not a digest
fn fixture() -> (Catalog, MemoryManifests) {
    let catalog = catalog(
        "test",
        &[r#"{"fmri": "app@1.0", "variants": {"variant.arch": ["i386", "sparc"]},
              "depends": [{"type": "require", "fmri": "libc", "facet": "facet.devel"}]}"#],
    );
    let manifests = manifests(vec![(
        "pkg://test/app@1.0",
        vec![
            dir("opt"),
            file("opt/motd", &sha256("hello")),
            link("opt/latest", "motd"),
            file("opt/blob", "payload-17"),
            file("opt/doc/README", "readme").with_facet("facet.doc"),
        ],
    )]);
    (catalog, manifests)
}

#[cfg(unix)]
fn populate(root: &Path) {
    use std::os::unix::fs::{PermissionsExt, symlink};
    let opt = root.join("opt");
    fs::create_dir_all(&opt).unwrap();
    fs::set_permissions(&opt, fs::Permissions::from_mode(0o755)).unwrap();
    for (name, content) in [("motd", "hello"), ("blob", "anything")] {
        let path = opt.join(name);
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }
    symlink("motd", opt.join("latest")).unwrap();
}

#[cfg(unix)]
#[test]
fn test_verify_then_repair() {
    let (catalog, manifests) = fixture();
    let root = tempfile::tempdir().unwrap();
    let mut state = installed(&["pkg://test/app@1.0"]);
    state.config.set_facet("facet.doc", Some(false)).unwrap();
    populate(root.path());

    let planner = Planner::new(&catalog, &manifests);
    let report = planner.verify(root.path(), &state, &[]).unwrap();
    assert!(report.is_clean(), "{:?}", report.issues);
    assert_eq!(report.checked, 4);

    fs::write(root.path().join("opt/motd"), "tampered").unwrap();
    fs::remove_file(root.path().join("opt/blob")).unwrap();
    fs::remove_file(root.path().join("opt/latest")).unwrap();
    std::os::unix::fs::symlink("elsewhere", root.path().join("opt/latest")).unwrap();

    let report = planner.verify(root.path(), &state, &["app".to_string()]).unwrap();
    let found: Vec<(String, &Finding)> = report
        .issues
        .iter()
        .map(|i| (i.action.to_string(), &i.finding))
        .collect();
    assert_eq!(found.len(), 3);
    assert!(matches!(
        found.iter().find(|(a, _)| a == "file opt/motd").unwrap().1,
        Finding::ContentMismatch { .. }
    ));
    assert_eq!(
        found.iter().find(|(a, _)| a == "file opt/blob").unwrap().1,
        &Finding::Missing
    );
    assert!(matches!(
        found.iter().find(|(a, _)| a == "link opt/latest").unwrap().1,
        Finding::LinkTarget { found, .. } if found == "elsewhere"
    ));
    assert_eq!(report.damaged().into_iter().collect::<Vec<_>>(), vec!["app"]);

    let mut plan = planner.repair(&state, &report).unwrap();
    let labels: Vec<String> = plan.actions().iter().map(PlannedAction::label).collect();
    let position = |label: &str| labels.iter().position(|l| l == label).unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(plan.actions()[position("install file opt/blob")].op, ActionOp::Install);
    assert!(position("update file opt/motd") < position("update link opt/latest"));
    assert!(plan.changes().is_empty());
    assert_eq!(plan.target_state(), &state);

    plan.prepare(&Fetched).unwrap();
}

#[test]
fn test_verify_unknown_package() {
    let (catalog, manifests) = fixture();
    let root = tempfile::tempdir().unwrap();
    let state = installed(&["pkg://test/app@1.0"]);
    let err = Planner::new(&catalog, &manifests)
        .verify(root.path(), &state, &["ghost".to_string()])
        .unwrap_err();
    assert!(matches!(err, Error::NotInstalled(name) if name == "ghost"));
}

#[test]
fn test_contents_follow_facets() {
    let (catalog, manifests) = fixture();
    let mut state = installed(&[]);
    let planner = Planner::new(&catalog, &manifests);
    let app = fmri("pkg://test/app@1.0");

    let paths = |state: &imagepkg::ImageState| -> Vec<String> {
        planner
            .contents(&app, state)
            .unwrap()
            .iter()
            .filter_map(|a| a.path())
            .collect()
    };
    assert_eq!(
        paths(&state),
        vec!["opt", "opt/blob", "opt/doc/README", "opt/latest", "opt/motd"]
    );
    state.config.set_facet("facet.doc", Some(false)).unwrap();
    assert!(!paths(&state).contains(&"opt/doc/README".to_string()));
}

#[test]
fn test_variant_and_facet_listing() {
    let (catalog, manifests) = fixture();
    let mut state = installed(&["pkg://test/app@1.0"]);
    state.config.set_facet("facet.doc", Some(false)).unwrap();
    state.config.set_variant("variant.debug", "true").unwrap();
    let planner = Planner::new(&catalog, &manifests);

    let variants = planner.variants(&state);
    let shown: Vec<(&str, Option<&str>, bool)> = variants
        .iter()
        .map(|s| (s.name.as_str(), s.value.as_deref(), s.explicit))
        .collect();
    assert_eq!(
        shown,
        vec![
            ("variant.arch", None, false),
            ("variant.debug", Some("true"), true),
        ]
    );

    let facets = planner.facets(&state).unwrap();
    let shown: Vec<(&str, Option<&str>, bool)> = facets
        .iter()
        .map(|s| (s.name.as_str(), s.value.as_deref(), s.explicit))
        .collect();
    assert_eq!(
        shown,
        vec![
            ("facet.devel", Some("true"), false),
            ("facet.doc", Some("false"), true),
        ]
    );
}

#[test]
fn test_history_records_operations() {
    let (_, manifests) = fixture();
    let catalog = catalog("test", &[r#"{"fmri": "app@1.0"}"#]);
    let (dir, mut image) = temp_image_with(&[]);
    let state = image.load_state().unwrap();
    let solution = common::solve(
        &catalog,
        &state,
        &imagepkg::SolveRequest::new().install(imagepkg::PackageSpec::name("app")),
    )
    .unwrap();
    let planner = Planner::new(&catalog, &manifests);

    let mut first = planner.evaluate(&state, &state.config, &solution).unwrap();
    first.prepare(&Fetched).unwrap();
    let cancel = imagepkg::CancelToken::new();
    cancel.cancel();
    Transaction::new(&mut image, TransactionOptions::new().with_cancel(cancel))
        .execute(&mut first, &mut MetadataOnly::new())
        .unwrap_err();

    let mut second = planner.evaluate(&state, &state.config, &solution).unwrap();
    second.prepare(&Fetched).unwrap();
    Transaction::new(&mut image, TransactionOptions::new())
        .execute(&mut second, &mut MetadataOnly::new())
        .unwrap();

    let entries = history(dir.path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].outcome, HistoryOutcome::Aborted);
    assert_eq!(entries[0].applied, 0);
    assert_eq!(entries[1].outcome, HistoryOutcome::Succeeded);
    assert_eq!(entries[1].applied, entries[1].planned);
    assert!(entries[1].description.contains("app"), "{}", entries[1].description);
}
