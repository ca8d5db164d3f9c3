use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use container_forensics::export::{ExportJob, ExportKinds, Targets};
use container_forensics::report::{self, ContainerSummary, TaskLog};
use container_forensics::{
    CancelToken, Config, ContainerExplorer, LabelFilter, Notifier, SystemMounter, Task,
};

const TASK_LOG: &str = "task.log";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        default_value = "./forensics_output",
        help = "Directory receiving reports and exported files"
    )]
    output: PathBuf,

    #[arg(long, global = true, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long = "root-path",
        global = true,
        help = "Container storage root relative to each mounted filesystem (repeatable)"
    )]
    root_paths: Vec<PathBuf>,

    #[arg(
        long = "container-id",
        global = true,
        help = "Only process containers whose ID starts with this prefix (repeatable)"
    )]
    container_ids: Vec<String>,

    #[arg(long, global = true, help = "Container Explorer binary")]
    explorer: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Args)]
struct Disks {
    #[arg(required = true, help = "Disk images (.raw, .img, .dd, .qcow, .qcow2, .qcow3)")]
    disks: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// List containers found on the disk images
    List(Disks),
    /// Report files added, modified or deleted in each container
    Drift(Disks),
    /// Export container filesystems
    Export {
        #[command(flatten)]
        disks: Disks,

        #[arg(long, help = "Write a .tar.gz archive per container")]
        archive: bool,

        #[arg(long, help = "Write a .raw ext4 image per container (default)")]
        image: bool,

        #[arg(long, help = "Label filter, e.g. app=web,tier=frontend")]
        filter: Option<String>,

        #[arg(
            long = "exclude-namespace",
            help = "Namespace to skip (repeatable, replaces the configured list)"
        )]
        exclude_namespaces: Vec<String>,
    },
    /// Copy files or directories out of each container
    Extract {
        #[command(flatten)]
        disks: Disks,

        #[arg(long = "path", required = true, help = "Absolute path inside the container (repeatable)")]
        paths: Vec<String>,
    },
}

fn write_reports<T: serde::Serialize>(
    output: &Path,
    name: &str,
    value: &T,
    markdown: &str,
) -> Result<PathBuf> {
    report::write_json(&output.join(format!("{name}.json")), value)?;
    let md_path = output.join(format!("{name}.md"));
    fs::write(&md_path, markdown)
        .with_context(|| format!("Failed to write {}", md_path.display()))?;
    Ok(md_path)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let notifier = Notifier::new(cli.verbose);
    env_logger::Builder::from_env(Env::default())
        .filter_level(notifier.verbosity_level().to_log_level())
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(explorer) = &cli.explorer {
        config.explorer_binary = explorer.clone();
    }
    debug!("Configuration: {:?}", config);

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to set Ctrl+C handler")?;

    let mounter = SystemMounter::new(&config);
    let explorer = ContainerExplorer::from_config(&config);
    let task = Task::new(&config, &mounter, &explorer)
        .with_custom_paths(cli.root_paths.clone())
        .with_container_ids(cli.container_ids.clone())
        .with_cancel_token(cancel)
        .with_notifier(&notifier)
        .with_log(TaskLog::new(cli.output.join(TASK_LOG)));

    let report_path = match &cli.command {
        Command::List(disks) => {
            let result = task.run_list(&disks.disks)?;
            let rows: Vec<ContainerSummary> =
                result.items.iter().map(ContainerSummary::from).collect();
            let markdown = report::listing_markdown(&result.items, &result.failures);
            write_reports(&cli.output, "containers", &rows, &markdown)?
        }
        Command::Drift(disks) => {
            let result = task.run_drift(&disks.disks)?;
            report::write_drift_csv(&cli.output.join("drift.csv"), &result.items)?;
            let markdown = report::drift_markdown(&result.items, &result.failures);
            write_reports(&cli.output, "drift", &result, &markdown)?
        }
        Command::Export {
            disks,
            archive,
            image,
            filter,
            exclude_namespaces,
        } => {
            let destination = cli.output.join("exports");
            fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create {}", destination.display()))?;

            let mut job = ExportJob::new(&destination, ExportKinds::new(*archive, *image), &config);
            if !cli.container_ids.is_empty() {
                job = job.with_targets(Targets::Ids(cli.container_ids.clone()));
            }
            if let Some(expression) = filter {
                job = job.with_label_filter(LabelFilter::parse(expression)?);
            }
            if !exclude_namespaces.is_empty() {
                job = job.with_excluded_namespaces(exclude_namespaces.clone());
            }

            let result = task.run_export(&disks.disks, &job)?;
            let markdown =
                report::export_markdown(&result.items, &result.skipped, &result.failures);
            write_reports(&cli.output, "export", &result, &markdown)?
        }
        Command::Extract { disks, paths } => {
            let destination = cli.output.join("extracted");
            fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create {}", destination.display()))?;

            let result = task.run_extract(&disks.disks, paths, &destination)?;
            let markdown = report::extract_markdown(&result.items, &result.failures);
            write_reports(&cli.output, "extract", &result, &markdown)?
        }
    };

    notifier.finish(&format!("Report written to {}", report_path.display()));
    info!("Report written to {}", report_path.display());
    Ok(())
}
