use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use docker_explorer::{
    history, Catalog, ContainerFilter, ExplorerConfig, MountPlanner, ScanPolicy, StorageRoot,
};

/// Explore a Docker storage directory offline.
#[derive(Debug, Parser)]
#[clap(name = "docker-explorer", version)]
pub struct App {
    /// The Docker data directory of the analysed host.
    #[clap(short = 'r', long = "docker-directory")]
    root: Option<PathBuf>,

    /// TOML configuration file.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Abort on the first malformed document instead of warning.
    #[clap(long)]
    fail_fast: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Listing {
    Repositories,
    RunningContainers,
    AllContainers,
    Images,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List repositories, containers or images as JSON.
    List {
        what: Listing,
        /// Skip containers whose image comes from this registry.
        #[clap(long = "exclude-registry")]
        exclude_registries: Vec<String>,
    },
    /// Show the build history of an image or container as JSON.
    History { id: String },
    /// Print the commands that mount a container or image read-only.
    Mount {
        id: String,
        mountpoint: PathBuf,
        /// Leave the container's volumes out.
        #[clap(long)]
        no_volumes: bool,
    },
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let mut config = match &args.config {
        Some(path) => ExplorerConfig::load(path)
            .with_context(|| format!("Loading configuration {}", path.display()))?,
        None => ExplorerConfig::default(),
    };
    if let Some(root) = args.root {
        config = config.with_docker_root(root);
    }
    if args.fail_fast {
        config = config.with_scan_policy(ScanPolicy::FailFast);
    }
    if let Command::Mount {
        no_volumes: true, ..
    } = args.cmd
    {
        config = config.with_mount_volumes(false);
    }

    let root = StorageRoot::open(config)?;
    let catalog = Catalog::build(&root)?;
    for warning in catalog.warnings() {
        eprintln!("warning: {}: {}", warning.path.display(), warning.message);
    }

    match args.cmd {
        Command::List {
            what,
            exclude_registries,
        } => match what {
            Listing::Repositories => print_json(catalog.repositories())?,
            Listing::Images => print_json(&catalog.list_images())?,
            Listing::RunningContainers | Listing::AllContainers => {
                let filter = ContainerFilter {
                    only_running: matches!(what, Listing::RunningContainers),
                    exclude_registries,
                };
                print_json(&catalog.list_containers(&filter))?
            }
        },
        Command::History { id } => {
            let history = history::history(&catalog, &id)
                .with_context(|| format!("Building history of {id}"))?;
            print_json(&history)?
        }
        Command::Mount { id, mountpoint, .. } => {
            let plan = MountPlanner::new(&root, &catalog)?
                .plan_mount(&id, &mountpoint)
                .with_context(|| format!("Planning mount of {id}"))?;
            for discrepancy in plan.discrepancies() {
                eprintln!("warning: {discrepancy}");
            }
            let (mounts, unmounts) = plan.commands();
            println!("# mount {id} at {}", mountpoint.display());
            for argv in mounts {
                println!("{}", argv.join(" "));
            }
            println!("# teardown");
            for argv in unmounts {
                println!("{}", argv.join(" "));
            }
        }
    }

    Ok(())
}
