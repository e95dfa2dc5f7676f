// src/cli.rs
//! CLI definitions for imagepkg
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "imagepkg")]
#[command(version)]
#[command(about = "Dependency solving and image planning for IPS-style images", long_about = None)]
pub struct Cli {
    /// Image root directory
    #[arg(short = 'R', long, global = true, default_value = "/")]
    pub root: PathBuf,

    /// Catalog feed as `[publisher=]FILE` (JSON lines); repeat in search order
    #[arg(long = "catalog", global = true, value_name = "FILE")]
    pub catalogs: Vec<String>,

    /// Package manifests (JSON lines of `{fmri, actions}`)
    #[arg(long, global = true, value_name = "FILE")]
    pub manifests: Option<PathBuf>,

    /// Engine configuration file (default: <root>/var/pkg/engine.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that produces a plan
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct PlanArgs {
    /// Compute and show the plan without executing it
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print the ordered plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty image
    Init,

    /// List installed packages
    List,

    /// Install packages (`name`, `name@version`, `pkg://pub/name@version`)
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Allow selecting versions older than those installed
        #[arg(long)]
        allow_downgrade: bool,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Remove installed packages
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Update the named packages, or everything when none are given
    Update {
        packages: Vec<String>,

        #[arg(long)]
        allow_downgrade: bool,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Show the plan for an operation without executing it
    Plan {
        #[command(subcommand)]
        operation: PlanOperation,

        /// Print the ordered plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Pin a package to a version (the installed one when none is given)
    Freeze {
        package: String,

        /// Recorded with the freeze and shown when it blocks an operation
        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove a freeze
    Unfreeze { package: String },

    /// Never install a package only to satisfy a dependency
    Avoid { package: String },

    /// Remove a package from the avoid list
    Unavoid { package: String },

    /// Change variant values (`variant.arch=sparc`) and re-plan the image
    ChangeVariant {
        #[arg(required = true)]
        assignments: Vec<String>,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Change facets (`facet.doc=false`, `facet.doc.*=none` to reset)
    ChangeFacet {
        #[arg(required = true)]
        assignments: Vec<String>,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Select a mediator version and/or implementation
    SetMediator {
        mediator: String,

        #[arg(long)]
        mediator_version: Option<String>,

        #[arg(long)]
        implementation: Option<String>,

        /// Drop the explicit selection and return to the default
        #[arg(long, conflicts_with_all = ["mediator_version", "implementation"])]
        unset: bool,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Set the publisher search order (highest priority first)
    SetPublishers {
        #[arg(required = true)]
        publishers: Vec<String>,
    },

    /// Attach a linked child image
    AttachChild {
        name: String,
        path: PathBuf,

        #[arg(long, value_enum, default_value = "recurse")]
        policy: PolicyArg,
    },

    /// Detach a linked child image
    DetachChild { path: PathBuf },

    /// List linked child images
    Children,

    /// Check installed content against the package manifests
    Verify {
        /// Packages to check (default: everything installed)
        packages: Vec<String>,
    },

    /// Re-deliver content that failed verification
    Fix {
        packages: Vec<String>,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Show what is installed or available for packages
    Info {
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// List the actions a package delivers into this image
    Contents { package: String },

    /// Show completed and abandoned transactions
    History,

    /// List variants set in the image or declared by installed packages
    Variant,

    /// List facets set in the image or referenced by installed packages
    Facet,

    /// Finish or report interrupted transactions
    Recover {
        /// Archive the journal of a transaction repaired externally
        #[arg(long, value_name = "UUID")]
        dismiss: Option<String>,
    },
}

/// Operations accepted by `plan`
#[derive(Subcommand, Debug, Clone)]
pub enum PlanOperation {
    Install {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(long)]
        allow_downgrade: bool,
    },
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    Update {
        packages: Vec<String>,

        #[arg(long)]
        allow_downgrade: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum PolicyArg {
    Recurse,
    Ignore,
    Exclude,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_accepts_allow_downgrade() {
        let cli = Cli::try_parse_from(["imagepkg", "plan", "install", "--allow-downgrade", "libc@1.0"])
            .unwrap();
        match cli.command {
            Commands::Plan {
                operation:
                    PlanOperation::Install {
                        packages,
                        allow_downgrade,
                    },
                json,
            } => {
                assert_eq!(packages, vec!["libc@1.0"]);
                assert!(allow_downgrade);
                assert!(!json);
            }
            _ => panic!("expected plan install"),
        }

        let cli = Cli::try_parse_from(["imagepkg", "plan", "update"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Plan {
                operation: PlanOperation::Update {
                    allow_downgrade: false,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn test_inspection_commands_parse() {
        let cli = Cli::try_parse_from(["imagepkg", "-R", "/mnt", "fix", "-n", "app"]).unwrap();
        assert_eq!(cli.root, PathBuf::from("/mnt"));
        assert!(matches!(cli.command, Commands::Fix { plan, .. } if plan.dry_run));

        let cli = Cli::try_parse_from(["imagepkg", "verify"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { packages } if packages.is_empty()));
        assert!(Cli::try_parse_from(["imagepkg", "info"]).is_err());
    }
}
