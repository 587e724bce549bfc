use clap::{Parser, Subcommand};
use incr_backup::backup::backup_config::{BackupConfig, Strategy};
use incr_backup::backup::cancel::CancelToken;
use incr_backup::backup::observer::TracingObserver;
use incr_backup::backup::pipeline::summary::BackupSummary;
use incr_backup::backup::pipeline::BackupPipeline;
use incr_backup::backup::restore::{restore, restore_backup_dir};
use incr_backup::backup::result_error::error::Error;
use incr_backup::backup::result_error::result::Result;
use incr_backup::backup::result_error::AddMsg;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

/// Incremental backup of big folders, one archive per changed subfolder
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up everything that changed since the last run
    Backup(BackupArgs),
    /// Unpack a container, or every container of a backup directory
    Restore {
        #[arg(short, long)]
        archive: PathBuf,
        #[arg(short, long)]
        destination: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct BackupArgs {
    /// Location of config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, required_unless_present = "config", conflicts_with = "config")]
    source: Option<PathBuf>,
    #[arg(short, long, required_unless_present = "config", conflicts_with = "config")]
    destination: Option<PathBuf>,
    #[arg(long, value_enum, conflicts_with = "config")]
    strategy: Option<Strategy>,
    /// Worker threads, defaults to the number of cores
    #[arg(short, long, conflicts_with = "config")]
    workers: Option<usize>,
}

impl BackupArgs {
    fn into_config(self) -> Result<BackupConfig> {
        let config = match (self.config, self.source, self.destination) {
            (Some(path), _, _) => return BackupConfig::load(path),
            (None, Some(source), Some(destination)) => BackupConfig::builder()
                .source(source)
                .destination(destination)
                .strategy(self.strategy.unwrap_or_default())
                .maybe_workers(self.workers)
                .build(),
            _ => {
                return Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "either --config or both --source and --destination are required",
                )))
            }
        };
        config
            .validate()
            .map_err(Error::from)
            .add_msg("Invalid backup arguments")?;
        Ok(config)
    }
}

fn backup(args: BackupArgs) -> Result<BackupSummary> {
    let config = args.into_config()?;
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, finishing in-flight writes");
        handler_token.cancel();
    }) {
        warn!("Cannot install Ctrl-C handler: {e}");
    }

    BackupPipeline::new(config, Arc::new(TracingObserver), cancel)?.run()
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match args.command {
        Command::Backup(args) => match backup(args) {
            Ok(summary) => {
                println!("{summary}");
                if summary.has_failures() {
                    exit(1);
                }
            }
            Err(e) if e.is_cancelled() => {
                warn!("Backup cancelled, completed units are recorded");
                exit(130);
            }
            Err(e) => {
                error!("{e}");
                exit(1);
            }
        },
        Command::Restore {
            archive,
            destination,
        } => {
            let res = if archive.is_dir() {
                restore_backup_dir(&archive, &destination).map(|restored| restored.len())
            } else {
                restore(&archive, &destination).map(|_| 1)
            };
            match res {
                Ok(count) => info!("Restored {count} containers into {:?}", destination),
                Err(e) => {
                    error!("{e}");
                    exit(1);
                }
            }
        }
    }
}
