// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, PlanArgs, PlanOperation};
use commands::Context;

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::new(cli.root, cli.catalogs, cli.manifests, cli.config)?;
    let keep = |config: &imagepkg::ImageConfig| -> Result<imagepkg::ImageConfig> { Ok(config.clone()) };

    match cli.command {
        Commands::Init => commands::cmd_init(&ctx),
        Commands::List => commands::cmd_list(&ctx),
        Commands::Install {
            packages,
            allow_downgrade,
            plan,
        } => commands::cmd_operation(
            &ctx,
            commands::install_request(&packages, allow_downgrade)?,
            keep,
            plan,
        ),
        Commands::Uninstall { packages, plan } => {
            commands::cmd_operation(&ctx, commands::uninstall_request(&packages), keep, plan)
        }
        Commands::Update {
            packages,
            allow_downgrade,
            plan,
        } => commands::cmd_operation(
            &ctx,
            commands::update_request(&packages, allow_downgrade)?,
            keep,
            plan,
        ),
        Commands::Plan { operation, json } => {
            let request = match operation {
                PlanOperation::Install {
                    packages,
                    allow_downgrade,
                } => commands::install_request(&packages, allow_downgrade)?,
                PlanOperation::Uninstall { packages } => commands::uninstall_request(&packages),
                PlanOperation::Update {
                    packages,
                    allow_downgrade,
                } => commands::update_request(&packages, allow_downgrade)?,
            };
            let args = PlanArgs {
                dry_run: true,
                json,
            };
            commands::cmd_operation(&ctx, request, keep, args)
        }
        Commands::Freeze { package, reason } => {
            commands::cmd_freeze(&ctx, &package, reason.as_deref())
        }
        Commands::Unfreeze { package } => commands::cmd_unfreeze(&ctx, &package),
        Commands::Avoid { package } => commands::cmd_avoid(&ctx, &package),
        Commands::Unavoid { package } => commands::cmd_unavoid(&ctx, &package),
        Commands::ChangeVariant { assignments, plan } => {
            commands::cmd_change_variant(&ctx, &assignments, plan)
        }
        Commands::ChangeFacet { assignments, plan } => {
            commands::cmd_change_facet(&ctx, &assignments, plan)
        }
        Commands::SetMediator {
            mediator,
            mediator_version,
            implementation,
            unset,
            plan,
        } => commands::cmd_set_mediator(
            &ctx,
            &mediator,
            mediator_version.as_deref(),
            implementation.as_deref(),
            unset,
            plan,
        ),
        Commands::SetPublishers { publishers } => commands::cmd_set_publishers(&ctx, &publishers),
        Commands::AttachChild { name, path, policy } => {
            commands::cmd_attach_child(&ctx, &name, &path, policy)
        }
        Commands::DetachChild { path } => commands::cmd_detach_child(&ctx, &path),
        Commands::Children => commands::cmd_children(&ctx),
        Commands::Verify { packages } => commands::cmd_verify(&ctx, &packages),
        Commands::Fix { packages, plan } => commands::cmd_fix(&ctx, &packages, plan),
        Commands::Info { packages } => commands::cmd_info(&ctx, &packages),
        Commands::Contents { package } => commands::cmd_contents(&ctx, &package),
        Commands::History => commands::cmd_history(&ctx),
        Commands::Variant => commands::cmd_settings(&ctx, false),
        Commands::Facet => commands::cmd_settings(&ctx, true),
        Commands::Recover { dismiss } => commands::cmd_recover(&ctx, dismiss.as_deref()),
    }
}
