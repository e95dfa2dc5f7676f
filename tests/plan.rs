// tests/plan.rs

//! Solve-then-plan scenarios: ordering, conflicts and ownership transfer.

mod common;

use common::{Fetched, catalog, dir, file, fmri, installed, link, manifests, solve};
use imagepkg::plan::{ContentAction, ManifestAction, MediatorTag, Overlay};
use imagepkg::{
    ActionOp, Catalog, Error, ImagePlan, ImageState, ManifestSource, PackageSpec, PlanState,
    Planner, SolveRequest, Version,
};

fn plan(
    catalog: &Catalog,
    manifests: &dyn ManifestSource,
    state: &ImageState,
    request: &SolveRequest,
) -> imagepkg::Result<ImagePlan> {
    let solution = solve(catalog, state, request)?;
    Planner::new(catalog, manifests).evaluate(state, &state.config, &solution)
}

fn labels(plan: &ImagePlan) -> Vec<String> {
    plan.actions().iter().map(|a| a.label()).collect()
}

fn install(name: &str) -> SolveRequest {
    SolveRequest::new().install(PackageSpec::name(name))
}

fn overlay_file(path: &str, hash: &str, overlay: Overlay) -> ManifestAction {
    ManifestAction::new(ContentAction::File {
        path: path.to_string(),
        hash: hash.to_string(),
        mode: 0o644,
        owner: "root".to_string(),
        group: "root".to_string(),
        overlay: Some(overlay),
        actuators: Vec::new(),
    })
}

#[test]
fn test_directories_before_contents() {
    let catalog = catalog("test", &[r#"{"fmri": "tool@1.0"}"#]);
    let manifests = manifests(vec![(
        "pkg://test/tool@1.0",
        vec![
            link("usr/bin/t", "tool"),
            file("usr/bin/tool", "aa"),
            dir("usr/bin"),
            dir("usr"),
        ],
    )]);
    let state = installed(&[]);

    let plan = plan(&catalog, &manifests, &state, &install("tool")).unwrap();
    assert_eq!(
        labels(&plan),
        vec![
            "install dir usr",
            "install dir usr/bin",
            "install file usr/bin/tool",
            "install link usr/bin/t",
        ]
    );
    assert_eq!(plan.summary().actions.get(&ActionOp::Install), Some(&4));
}

#[test]
fn test_same_path_from_two_packages_conflicts() {
    let catalog = catalog("test", &[r#"{"fmri": "a@1.0"}"#, r#"{"fmri": "b@1.0"}"#]);
    let state = installed(&[]);
    let request = install("a").install(PackageSpec::name("b"));

    let different = manifests(vec![
        ("pkg://test/a@1.0", vec![file("etc/foo", "11")]),
        ("pkg://test/b@1.0", vec![file("etc/foo", "22")]),
    ]);
    let err = plan(&catalog, &different, &state, &request).unwrap_err();
    let Error::PathConflict(conflict) = err else {
        panic!("expected a path conflict, got {:?}", err);
    };
    assert_eq!(conflict.key.id, "etc/foo");
    assert_eq!(
        conflict.owners,
        vec![fmri("pkg://test/a@1.0"), fmri("pkg://test/b@1.0")]
    );

    // byte-identical files still have two owners
    let identical = manifests(vec![
        ("pkg://test/a@1.0", vec![file("etc/foo", "11")]),
        ("pkg://test/b@1.0", vec![file("etc/foo", "11")]),
    ]);
    assert!(matches!(
        plan(&catalog, &identical, &state, &request),
        Err(Error::PathConflict(_))
    ));

    // a shared directory is fine
    let shared = manifests(vec![
        ("pkg://test/a@1.0", vec![dir("etc")]),
        ("pkg://test/b@1.0", vec![dir("etc")]),
    ]);
    let ok = plan(&catalog, &shared, &state, &request).unwrap();
    assert_eq!(labels(&ok), vec!["install dir etc"]);
}

#[test]
fn test_overlay_replaces_allowed_file() {
    let catalog = catalog("test", &[r#"{"fmri": "base@1.0"}"#, r#"{"fmri": "site@1.0"}"#]);
    let manifests = manifests(vec![
        (
            "pkg://test/base@1.0",
            vec![overlay_file("etc/motd", "base", Overlay::Allow)],
        ),
        (
            "pkg://test/site@1.0",
            vec![overlay_file("etc/motd", "site", Overlay::True)],
        ),
    ]);
    let state = installed(&["pkg://test/base@1.0"]);

    let plan = plan(&catalog, &manifests, &state, &install("site")).unwrap();
    assert_eq!(plan.actions().len(), 1);
    let step = &plan.actions()[0];
    assert_eq!(step.op, ActionOp::Update);
    assert_eq!(step.to, Some(fmri("pkg://test/site@1.0")));
}

#[test]
fn test_ordering_hint_cycle() {
    let catalog = catalog("test", &[r#"{"fmri": "a@1.0"}"#]);
    let manifests = manifests(vec![(
        "pkg://test/a@1.0",
        vec![
            file("etc/one", "1").after("etc/two"),
            file("etc/two", "2").after("etc/one"),
        ],
    )]);
    let state = installed(&[]);

    match plan(&catalog, &manifests, &state, &install("a")) {
        Err(Error::PlanCycle { actions }) => {
            assert_eq!(actions, vec!["install file etc/one", "install file etc/two"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[test]
fn test_rename_transfers_ownership() {
    let catalog = catalog("test", &[r#"{"fmri": "old@1.0"}"#, r#"{"fmri": "new@1.0"}"#]);
    let manifests = manifests(vec![
        ("pkg://test/old@1.0", vec![file("usr/bin/x", "same")]),
        (
            "pkg://test/new@1.0",
            vec![file("usr/bin/x", "same"), file("usr/bin/y", "extra")],
        ),
    ]);
    let state = installed(&["pkg://test/old@1.0"]);
    let request = SolveRequest::new()
        .remove("old")
        .install(PackageSpec::name("new"));

    let plan = plan(&catalog, &manifests, &state, &request).unwrap();
    let transfer = plan
        .actions()
        .iter()
        .find(|a| a.key.id == "usr/bin/x")
        .unwrap();
    assert_eq!(transfer.op, ActionOp::Transfer);
    assert_eq!(transfer.from, Some(fmri("pkg://test/old@1.0")));
    assert_eq!(transfer.to, Some(fmri("pkg://test/new@1.0")));
    assert_eq!(plan.summary().remove, vec![fmri("pkg://test/old@1.0")]);
    assert_eq!(plan.summary().install, vec![fmri("pkg://test/new@1.0")]);
}

#[test]
fn test_update_changes_content_and_removes_stale() {
    let catalog = catalog("test", &[r#"{"fmri": "app@1.0"}"#, r#"{"fmri": "app@2.0"}"#]);
    let manifests = manifests(vec![
        (
            "pkg://test/app@1.0",
            vec![dir("opt"), file("opt/app", "v1"), file("opt/legacy", "v1")],
        ),
        ("pkg://test/app@2.0", vec![dir("opt"), file("opt/app", "v2")]),
    ]);
    let state = installed(&["pkg://test/app@1.0"]);

    let plan = plan(
        &catalog,
        &manifests,
        &state,
        &SolveRequest::new().update(PackageSpec::name("app")),
    )
    .unwrap();
    // the unchanged directory only changes owner
    assert_eq!(
        labels(&plan),
        vec!["remove file opt/legacy", "transfer dir opt", "update file opt/app"]
    );
    assert_eq!(plan.summary().update.len(), 1);
}

#[test]
fn test_applied_plan_is_idempotent() {
    let catalog = catalog("test", &[r#"{"fmri": "tool@1.0"}"#]);
    let manifests = manifests(vec![("pkg://test/tool@1.0", vec![file("bin/tool", "aa")])]);
    let state = installed(&[]);

    let first = plan(&catalog, &manifests, &state, &install("tool")).unwrap();
    assert!(!first.is_empty());

    let after = first.target_state().clone();
    let second = plan(&catalog, &manifests, &after, &install("tool")).unwrap();
    assert!(second.is_empty());
    assert!(second.actions().is_empty());
}

#[test]
fn test_mediated_link_only_from_active_provider() {
    let catalog = catalog(
        "test",
        &[
            r#"{"fmri": "python-39@3.9", "mediators": [{"mediator": "python", "version": "3.9"}]}"#,
            r#"{"fmri": "python-311@3.11", "mediators": [{"mediator": "python", "version": "3.11"}]}"#,
        ],
    );
    let tag = |version: &str| MediatorTag {
        name: "python".to_string(),
        version: Some(Version::parse(version).unwrap()),
        implementation: None,
    };
    let manifests = manifests(vec![
        (
            "pkg://test/python-39@3.9",
            vec![
                file("usr/bin/python3.9", "39"),
                link("usr/bin/python", "python3.9").with_mediator(tag("3.9")),
            ],
        ),
        (
            "pkg://test/python-311@3.11",
            vec![
                file("usr/bin/python3.11", "311"),
                link("usr/bin/python", "python3.11").with_mediator(tag("3.11")),
            ],
        ),
    ]);
    let state = installed(&[]);
    let request = install("python-39").install(PackageSpec::name("python-311"));

    let plan = plan(&catalog, &manifests, &state, &request).unwrap();
    let python = plan
        .actions()
        .iter()
        .find(|a| a.key.id == "usr/bin/python")
        .unwrap();
    assert_eq!(python.to, Some(fmri("pkg://test/python-311@3.11")));
    assert_eq!(plan.summary().mediator_changes.len(), 1);
}

#[test]
fn test_prepare_then_abort() {
    let catalog = catalog("test", &[r#"{"fmri": "tool@1.0"}"#]);
    let manifests = manifests(vec![("pkg://test/tool@1.0", vec![file("bin/tool", "aa")])]);
    let state = installed(&[]);

    let mut plan = plan(&catalog, &manifests, &state, &install("tool")).unwrap();
    plan.prepare(&Fetched).unwrap();
    assert_eq!(plan.state(), PlanState::Prepared);

    let json: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
    assert_eq!(json["state"], "prepared");
    assert_eq!(json["actions"].as_array().map(Vec::len), Some(1));

    plan.abort().unwrap();
    assert_eq!(plan.state(), PlanState::Aborted);
}
