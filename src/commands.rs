// src/commands.rs
//! Command handlers for the imagepkg CLI
//!
//! Content delivery and filesystem changes belong to an external executor:
//! these handlers compute plans, print them, and record the resulting image
//! state and configuration.

use crate::cli::{PlanArgs, PolicyArg};
use anyhow::{Context as _, Result, anyhow, bail};
use imagepkg::catalog::{Catalog, CatalogFeed, CatalogView, FileFeed};
use imagepkg::config::EngineConfig;
use imagepkg::fmri::{Fmri, PackageSpec, Version};
use imagepkg::image::{Image, ImageConfig, MediatorSetting};
use imagepkg::linked::{ChildRelation, Coordinator, DiskImages, LinkPolicy, LinkedPlan, LockSet};
use imagepkg::plan::{ContentAction, ContentFetcher, MemoryManifests, Planner};
use imagepkg::progress;
use imagepkg::solver::{SolveRequest, Solver};
use imagepkg::transaction::{
    self, ActionExecutor, MetadataOnly, RecoveryOutcome, Transaction, TransactionOptions,
};
use imagepkg::paths;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Inputs shared by every command
pub struct Context {
    pub root: PathBuf,
    pub catalogs: Vec<String>,
    pub manifests: Option<PathBuf>,
    pub config: EngineConfig,
}

impl Context {
    pub fn new(
        root: PathBuf,
        catalogs: Vec<String>,
        manifests: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(|| paths::config_path(&root));
        let config = EngineConfig::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        Ok(Self {
            root,
            catalogs,
            manifests,
            config,
        })
    }

    fn open_image(&self) -> Result<Image> {
        Image::open(&self.root)
            .with_context(|| format!("Failed to open image at {}", self.root.display()))
    }

    fn load_catalog(&self) -> Result<Catalog> {
        if self.catalogs.is_empty() {
            bail!("No catalog given; pass --catalog [publisher=]FILE");
        }
        let feeds: Vec<Box<dyn CatalogFeed>> = self
            .catalogs
            .iter()
            .map(|arg| {
                let (publisher, file) = match arg.split_once('=') {
                    Some((publisher, file)) => (publisher.to_string(), PathBuf::from(file)),
                    None => {
                        let file = PathBuf::from(arg);
                        let publisher = file
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or("default")
                            .to_string();
                        (publisher, file)
                    }
                };
                Box::new(FileFeed::new(&publisher, file)) as Box<dyn CatalogFeed>
            })
            .collect();

        let catalog = Catalog::load(&feeds, self.config.catalog.parallel)?;
        let report = catalog.report();
        info!(
            "Catalog: {} entries loaded, {} skipped, {} duplicates",
            report.loaded, report.skipped, report.duplicates
        );
        for anomaly in &report.anomalies {
            warn!("Catalog anomaly: {}", anomaly);
        }
        Ok(catalog)
    }

    fn load_manifests(&self) -> Result<MemoryManifests> {
        match &self.manifests {
            Some(path) => Ok(MemoryManifests::load(path)?),
            None => Ok(MemoryManifests::new()),
        }
    }
}

/// Content is delivered by the external executor along with each action
struct ExternalContent;

impl ContentFetcher for ExternalContent {
    fn fetch(&self, owner: &Fmri, action: &ContentAction) -> imagepkg::Result<()> {
        debug!("Content for {} of {} delivered externally", action, owner);
        Ok(())
    }
}

pub fn cmd_init(ctx: &Context) -> Result<()> {
    Image::create(&ctx.root)?;
    println!("Image initialized at {}", ctx.root.display());
    Ok(())
}

pub fn cmd_list(ctx: &Context) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let state = image.load_state()?;

    if state.installed.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }
    for (name, fmri) in &state.installed {
        let frozen = if state.config.is_frozen(name) { " (frozen)" } else { "" };
        println!("{}{}", fmri, frozen);
    }
    Ok(())
}

fn parse_specs(packages: &[String]) -> Result<Vec<PackageSpec>> {
    packages
        .iter()
        .map(|p| PackageSpec::parse(p).with_context(|| format!("Invalid package '{}'", p)))
        .collect()
}

pub fn install_request(packages: &[String], allow_downgrade: bool) -> Result<SolveRequest> {
    let mut request = SolveRequest::new().allow_downgrade(allow_downgrade);
    for spec in parse_specs(packages)? {
        request = request.install(spec);
    }
    Ok(request)
}

pub fn uninstall_request(packages: &[String]) -> SolveRequest {
    packages
        .iter()
        .fold(SolveRequest::new(), |request, name| request.remove(name))
}

pub fn update_request(packages: &[String], allow_downgrade: bool) -> Result<SolveRequest> {
    let mut request = SolveRequest::new().allow_downgrade(allow_downgrade);
    if packages.is_empty() {
        return Ok(request.update_all());
    }
    for spec in parse_specs(packages)? {
        request = request.update(spec);
    }
    Ok(request)
}

/// Solve, plan, show, and unless this is a dry run record the result
///
/// `target_config` derives the configuration the image will have afterwards
/// from the current one.
pub fn cmd_operation(
    ctx: &Context,
    request: SolveRequest,
    target_config: impl FnOnce(&ImageConfig) -> Result<ImageConfig>,
    args: PlanArgs,
) -> Result<()> {
    let mut image = ctx.open_image()?;
    let children = image.children()?;
    let _locks = LockSet::acquire(image.root(), &children, ctx.config.image.lock_retries)?;
    let executing = !(args.dry_run || request.dry_run);
    if executing {
        transaction::ensure_no_pending(image.root())?;
    }

    let state = image.load_state()?;
    let target = target_config(&state.config)?;
    let catalog = ctx.load_catalog()?;
    let manifests = ctx.load_manifests()?;

    let view = CatalogView::new(&catalog, &target);
    let solution = Solver::new(&view, &state)
        .with_options(ctx.config.solver.clone())
        .solve(&request)?;
    solution.verify(&view, &state)?;
    info!(
        "Solved '{}' in {} step(s)",
        request.describe(),
        solution.stats.steps
    );

    let plan = Planner::new(&catalog, &manifests)
        .with_options(ctx.config.plan.clone())
        .evaluate(&state, &target, &solution)?;

    let progress = progress::for_terminal("Executing plan", plan.actions().len() as u64);
    let coordinator = Coordinator::new(&catalog, &manifests)
        .with_solver_options(ctx.config.solver.clone())
        .with_plan_options(ctx.config.plan.clone())
        .with_progress(progress);
    let mut linked = coordinator.plan(plan, &children, &DiskImages)?;

    show_plan(&linked, args.json)?;

    if !executing {
        linked.abort();
        return Ok(());
    }
    if linked.is_empty() {
        return Ok(());
    }

    linked.prepare(&ExternalContent)?;
    let mut executors = |root: &Path| -> Box<dyn ActionExecutor> {
        debug!("Recording actions for {}", root.display());
        Box::new(MetadataOnly::new())
    };
    coordinator.execute(&mut image, &mut linked, &mut executors)?;

    if !args.json {
        println!("Image updated.");
    }
    Ok(())
}

fn show_plan(linked: &LinkedPlan, json: bool) -> Result<()> {
    if json {
        let mut children = Vec::new();
        for child in &linked.children {
            children.push(serde_json::json!({
                "name": child.relation.name,
                "path": child.relation.path,
                "plan": serde_json::from_str::<serde_json::Value>(&child.plan.to_json()?)?,
            }));
        }
        let doc = serde_json::json!({
            "plan": serde_json::from_str::<serde_json::Value>(&linked.parent.to_json()?)?,
            "children": children,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    print!("{}", linked.parent.summary());
    for change in linked.parent.changes() {
        debug!("  {}", change);
    }
    for child in &linked.children {
        println!("Linked image {} ({}):", child.relation.name, child.relation.path.display());
        print!("{}", child.plan.summary());
    }
    for (child, reason) in &linked.skipped {
        println!("Skipped linked image {}: {}", child.name, reason);
    }
    Ok(())
}

/// Change the image configuration without re-solving
fn update_config(ctx: &Context, change: impl FnOnce(&mut imagepkg::ImageState) -> Result<()>) -> Result<()> {
    let mut image = ctx.open_image()?;
    let _lock = image.lock_exclusive(ctx.config.image.lock_retries)?;
    transaction::ensure_no_pending(image.root())?;
    let mut state = image.load_state()?;
    change(&mut state)?;
    image.save_state(&state)?;
    Ok(())
}

pub fn cmd_freeze(ctx: &Context, package: &str, reason: Option<&str>) -> Result<()> {
    let spec = PackageSpec::parse(package)?;
    update_config(ctx, |state| {
        let installed = state.installed(&spec.name).cloned();
        state.config.freeze(&spec, installed.as_ref(), reason)?;
        Ok(())
    })?;
    println!("Frozen {}", spec);
    Ok(())
}

pub fn cmd_unfreeze(ctx: &Context, package: &str) -> Result<()> {
    update_config(ctx, |state| {
        state.config.unfreeze(package)?;
        Ok(())
    })?;
    println!("Unfrozen {}", package);
    Ok(())
}

pub fn cmd_avoid(ctx: &Context, package: &str) -> Result<()> {
    update_config(ctx, |state| {
        state.config.avoid(package);
        Ok(())
    })?;
    println!("Avoiding {}", package);
    Ok(())
}

pub fn cmd_unavoid(ctx: &Context, package: &str) -> Result<()> {
    update_config(ctx, |state| Ok(state.config.unavoid(package)?))?;
    println!("No longer avoiding {}", package);
    Ok(())
}

pub fn cmd_set_publishers(ctx: &Context, publishers: &[String]) -> Result<()> {
    update_config(ctx, |state| {
        Ok(state.config.set_publishers(publishers.to_vec())?)
    })?;
    println!("Publisher search order: {}", publishers.join(", "));
    Ok(())
}

fn split_assignment(assignment: &str) -> Result<(&str, &str)> {
    assignment
        .split_once('=')
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .ok_or_else(|| anyhow!("Expected NAME=VALUE, got '{}'", assignment))
}

pub fn cmd_change_variant(ctx: &Context, assignments: &[String], args: PlanArgs) -> Result<()> {
    let parsed = assignments
        .iter()
        .map(|a| split_assignment(a))
        .collect::<Result<Vec<_>>>()?;
    cmd_operation(
        ctx,
        SolveRequest::new(),
        |config| {
            let mut target = config.clone();
            for (name, value) in &parsed {
                target.set_variant(name, value)?;
            }
            Ok(target)
        },
        args,
    )
}

pub fn cmd_change_facet(ctx: &Context, assignments: &[String], args: PlanArgs) -> Result<()> {
    let parsed = assignments
        .iter()
        .map(|a| {
            let (name, value) = split_assignment(a)?;
            let value = match value {
                "true" => Some(true),
                "false" => Some(false),
                "none" | "default" => None,
                other => bail!("Facet value must be true, false or none, got '{}'", other),
            };
            Ok((name, value))
        })
        .collect::<Result<Vec<_>>>()?;
    cmd_operation(
        ctx,
        SolveRequest::new(),
        |config| {
            let mut target = config.clone();
            for (name, value) in &parsed {
                target.set_facet(name, *value)?;
            }
            Ok(target)
        },
        args,
    )
}

pub fn cmd_set_mediator(
    ctx: &Context,
    mediator: &str,
    version: Option<&str>,
    implementation: Option<&str>,
    unset: bool,
    args: PlanArgs,
) -> Result<()> {
    let version = version
        .map(Version::parse)
        .transpose()
        .with_context(|| format!("Invalid version for mediator {}", mediator))?;
    if !unset && version.is_none() && implementation.is_none() {
        bail!("Give --mediator-version and/or --implementation, or --unset");
    }
    cmd_operation(
        ctx,
        SolveRequest::new(),
        |config| {
            let mut target = config.clone();
            if unset {
                target.unset_mediator(mediator)?;
            } else {
                target.set_mediator(
                    mediator,
                    MediatorSetting {
                        version,
                        implementation: implementation.map(str::to_string),
                    },
                )?;
            }
            Ok(target)
        },
        args,
    )
}

pub fn cmd_attach_child(ctx: &Context, name: &str, path: &Path, policy: PolicyArg) -> Result<()> {
    let policy = match policy {
        PolicyArg::Recurse => LinkPolicy::Recurse,
        PolicyArg::Ignore => LinkPolicy::Ignore,
        PolicyArg::Exclude => LinkPolicy::Exclude,
    };
    Image::open(path).with_context(|| format!("{} is not an image", path.display()))?;

    let image = ctx.open_image()?;
    let _lock = image.lock_exclusive(ctx.config.image.lock_retries)?;
    image.attach_child(&ChildRelation::new(name, path, policy))?;
    println!("Attached {} at {} ({})", name, path.display(), policy);
    Ok(())
}

pub fn cmd_detach_child(ctx: &Context, path: &Path) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_exclusive(ctx.config.image.lock_retries)?;
    let child = image
        .children()?
        .into_iter()
        .find(|c| c.path == path)
        .ok_or_else(|| anyhow!("{} is not attached", path.display()))?;
    child.state.transition(imagepkg::ChildState::Detached)?;
    image.detach_child(path)?;
    println!("Detached {}", child.name);
    Ok(())
}

pub fn cmd_children(ctx: &Context) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let children = image.children()?;
    if children.is_empty() {
        println!("No linked images.");
    }
    for child in children {
        println!(
            "{}\t{}\t{}\t{}",
            child.name,
            child.path.display(),
            child.policy,
            child.state
        );
    }
    Ok(())
}

pub fn cmd_recover(ctx: &Context, dismiss: Option<&str>) -> Result<()> {
    let mut image = ctx.open_image()?;
    let _lock = image.lock_exclusive(ctx.config.image.lock_retries)?;

    if let Some(tx_uuid) = dismiss {
        transaction::dismiss(&paths::journal_dir(image.root()), tx_uuid)?;
        println!("Dismissed transaction {}", tx_uuid);
        return Ok(());
    }

    let progress = progress::for_terminal("Recovering", 0);
    let outcomes = transaction::recover_all_with(&mut image, progress.as_ref())?;
    if outcomes.is_empty() {
        println!("No interrupted transactions.");
    }
    for outcome in outcomes {
        match outcome {
            RecoveryOutcome::Clean { tx_uuid } => {
                println!("{}: nothing was applied; discarded", tx_uuid)
            }
            RecoveryOutcome::RolledForward { tx_uuid } => {
                println!("{}: all actions were applied; state recorded", tx_uuid)
            }
            RecoveryOutcome::NeedsRepair(summary) => {
                println!(
                    "{}: {} of {} action(s) applied; repair externally, then --dismiss",
                    summary.tx_uuid,
                    summary.applied.len(),
                    summary.planned.len()
                );
                for index in &summary.applied {
                    println!("  applied  {}", applied_label(&summary.planned, *index));
                }
                for label in summary.pending() {
                    println!("  pending  {}", label);
                }
                if let Some(failure) = &summary.failure {
                    println!("  failed   {}", failure);
                }
            }
            RecoveryOutcome::Corrupted { tx_uuid, error } => {
                println!("{}: journal corrupted: {}", tx_uuid, error)
            }
        }
    }
    Ok(())
}

/// Label of an applied action as journaled; indices come from disk
fn applied_label(planned: &[String], index: usize) -> String {
    match planned.get(index) {
        Some(label) => label.clone(),
        None => format!("action #{} (not in the plan)", index),
    }
}

pub fn cmd_verify(ctx: &Context, packages: &[String]) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let state = image.load_state()?;
    let catalog = ctx.load_catalog()?;
    let manifests = ctx.load_manifests()?;

    let report = Planner::new(&catalog, &manifests)
        .with_options(ctx.config.plan.clone())
        .verify(image.root(), &state, packages)?;
    for issue in &report.issues {
        println!("ERROR  {}", issue);
    }
    let damaged = report.damaged();
    println!(
        "{} path(s) checked, {} issue(s) in {} package(s)",
        report.checked,
        report.issues.len(),
        damaged.len()
    );
    if !report.is_clean() {
        bail!(
            "Image content differs from the manifests of: {}; run fix to repair",
            damaged.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

/// Re-deliver damaged content without changing the package set
pub fn cmd_fix(ctx: &Context, packages: &[String], args: PlanArgs) -> Result<()> {
    let mut image = ctx.open_image()?;
    let _lock = image.lock_exclusive(ctx.config.image.lock_retries)?;
    if !args.dry_run {
        transaction::ensure_no_pending(image.root())?;
    }
    let state = image.load_state()?;
    let catalog = ctx.load_catalog()?;
    let manifests = ctx.load_manifests()?;

    let planner = Planner::new(&catalog, &manifests).with_options(ctx.config.plan.clone());
    let report = planner.verify(image.root(), &state, packages)?;
    if report.is_clean() {
        println!("No damaged content found ({} path(s) checked).", report.checked);
        return Ok(());
    }
    let mut plan = planner.repair(&state, &report)?;

    if args.json {
        println!("{}", plan.to_json()?);
    } else {
        for issue in &report.issues {
            println!("  {}", issue);
        }
        print!("{}", plan.summary());
    }
    if args.dry_run {
        plan.abort()?;
        return Ok(());
    }

    plan.prepare(&ExternalContent)?;
    let progress = progress::for_terminal("Repairing", plan.actions().len() as u64);
    let result = Transaction::new(&mut image, TransactionOptions::new().with_progress(progress))
        .execute(&mut plan, &mut MetadataOnly::new())?;
    if !args.json {
        println!("Repaired {} object(s).", result.applied);
    }
    Ok(())
}

pub fn cmd_info(ctx: &Context, packages: &[String]) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let state = image.load_state()?;
    let catalog = ctx.load_catalog()?;
    let view = CatalogView::new(&catalog, &state.config);

    for (i, spec) in parse_specs(packages)?.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print!("{}", view.info(&state, spec)?);
    }
    Ok(())
}

pub fn cmd_contents(ctx: &Context, package: &str) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let state = image.load_state()?;
    let catalog = ctx.load_catalog()?;
    let manifests = ctx.load_manifests()?;

    let spec = PackageSpec::parse(package).with_context(|| format!("Invalid package '{}'", package))?;
    let info = CatalogView::new(&catalog, &state.config).info(&state, &spec)?;
    for action in Planner::new(&catalog, &manifests).contents(&info.fmri, &state)? {
        println!("{}", action);
    }
    Ok(())
}

pub fn cmd_history(ctx: &Context) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let entries = transaction::history(image.root())?;
    if entries.is_empty() {
        println!("No transactions recorded.");
    }
    for entry in entries {
        println!("{}", entry);
    }
    Ok(())
}

/// List variants, or facets when `facets` is set
pub fn cmd_settings(ctx: &Context, facets: bool) -> Result<()> {
    let image = ctx.open_image()?;
    let _lock = image.lock_shared(ctx.config.image.lock_retries)?;
    let state = image.load_state()?;
    let catalog = ctx.load_catalog()?;
    let manifests = ctx.load_manifests()?;

    let planner = Planner::new(&catalog, &manifests);
    let settings = if facets {
        planner.facets(&state)?
    } else {
        planner.variants(&state)
    };
    if settings.is_empty() {
        println!("No {} in use.", if facets { "facets" } else { "variants" });
    }
    for setting in settings {
        println!("{}", setting);
    }
    Ok(())
}
