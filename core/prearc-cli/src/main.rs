//! prearc: operator CLI for the prearchive staging area.
//!
//! Runs every operation as the service account. Records and reports are
//! printed to stdout as JSON; diagnostics go to stderr through tracing.
//!
//! ## Subcommands
//!
//! - `status`, `list`, `stuck`: inspect records
//! - `add`, `discover`, `reset`, `rebuild`, `set-status`, `delete`: lifecycle operations
//! - `receiving`, `clean-locks`: file lock inspection and hygiene
//! - `decide`: auto-archive and overwrite decision dry-run
//! - `log`: per-session log sidecar
//! - `timestamp`: make or check a timestamp directory name

mod logging;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use prearc_core::{
    make_timestamp_dir, parse_timestamp_dir, ArchiveRequest, BuildRequest, PrearcConfig,
    PrearcError, PrearcStatus, Prearchive, RequestMetadata, Triple, User,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Prearc(#[from] PrearcError),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

type CliResult = Result<(), CliError>;

#[derive(Parser)]
#[command(name = "prearc")]
#[command(about = "Prearchive staging area operations")]
#[command(version)]
struct Cli {
    /// Config file (default: $PREARC_CONFIG, then ~/.prearc/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one staged session.
#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Project ID or alias; omit for unassigned sessions
    #[arg(long, short)]
    project: Option<String>,

    /// Timestamp directory, e.g. 20240102_030405
    #[arg(value_name = "TIMESTAMP")]
    timestamp: String,

    /// Session folder name
    #[arg(value_name = "FOLDER")]
    folder: String,
}

impl SessionArgs {
    fn triple(&self) -> Triple {
        Triple::new(self.project.as_deref(), &self.timestamp, &self.folder)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the status of a session, or "none" if it has no record
    Status {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// List records for a project (unassigned when omitted)
    List {
        #[arg(long, short)]
        project: Option<String>,
    },

    /// Register a staged session from what is on disk
    Add {
        #[command(flatten)]
        session: SessionArgs,

        /// Correlation tag overriding the session document
        #[arg(long)]
        tag: Option<String>,
    },

    /// Register every on-disk session of a project that has no record
    Discover {
        #[arg(long, short)]
        project: Option<String>,
    },

    /// Forget a record and re-derive it from disk, keeping policy fields
    Reset {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Rebuild the session document
    Rebuild {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Set a session's status directly
    SetStatus {
        #[command(flatten)]
        session: SessionArgs,

        /// Status name, e.g. READY or _BUILDING
        #[arg(value_name = "STATUS")]
        status: PrearcStatus,
    },

    /// Delete a staged session and its record
    Delete {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Report whether any file lock is held for a session
    Receiving {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Remove empty lock directories left behind for a session
    CleanLocks {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// List records stuck in an in-process state
    Stuck {
        /// Minimum time in the in-process state
        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },

    /// Evaluate the auto-archive and overwrite decisions without acting
    Decide {
        #[command(flatten)]
        session: SessionArgs,

        /// Import destination, e.g. /archive/projects/ALPHA
        #[arg(long)]
        destination: Option<String>,

        /// Per-request auto-archive override
        #[arg(long, value_name = "BOOL")]
        auto_archive: Option<bool>,

        /// Per-request overwrite override
        #[arg(long, value_name = "BOOL")]
        overwrite: Option<bool>,
    },

    /// Per-session log entries
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },

    /// Print a new timestamp directory name, or validate one
    Timestamp {
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
struct BuildArgs {
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    visit: Option<String>,
    #[arg(long)]
    protocol: Option<String>,
    #[arg(long)]
    timezone: Option<String>,
    #[arg(long)]
    source: Option<String>,
}

impl From<BuildArgs> for BuildRequest {
    fn from(args: BuildArgs) -> Self {
        BuildRequest {
            label: args.label,
            subject: args.subject,
            visit: args.visit,
            protocol: args.protocol,
            timezone: args.timezone,
            source: args.source,
        }
    }
}

#[derive(Subcommand)]
enum LogCommands {
    /// Append an entry
    Append {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(value_name = "MESSAGE")]
        message: String,
    },
    /// List entry IDs, oldest first
    List {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Print one entry
    Show {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        id: String,
    },
    /// Print the most recent entry
    Last {
        #[command(flatten)]
        session: SessionArgs,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "prearc failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult {
    // Timestamp handling needs no config or database.
    if let Commands::Timestamp { name } = &cli.command {
        return timestamp(name.as_deref());
    }

    let config = PrearcConfig::load(cli.config.as_deref())?;
    let prearchive = Prearchive::from_config(config)?;
    let account = User::system();

    match cli.command {
        Commands::Status { session } => {
            match prearchive.get_status(&session.triple())? {
                Some(status) => println!("{status}"),
                None => println!("none"),
            }
            Ok(())
        }
        Commands::List { project } => {
            print_json(&prearchive.list_sessions(&account, project.as_deref())?)
        }
        Commands::Add { session, tag } => {
            print_json(&prearchive.add_session(&session.triple(), tag.as_deref())?)
        }
        Commands::Discover { project } => {
            print_json(&prearchive.discover_sessions(&account, project.as_deref())?)
        }
        Commands::Reset { session, tag } => {
            print_json(&prearchive.reset_status(&session.triple(), tag.as_deref())?)
        }
        Commands::Rebuild { session, build } => {
            let request = BuildRequest::from(build);
            print_json(&prearchive.rebuild_session(&session.triple(), &request)?)
        }
        Commands::SetStatus { session, status } => {
            print_json(&prearchive.set_status(&account, &session.triple(), status)?)
        }
        Commands::Delete { session } => {
            prearchive.delete_session(&account, &session.triple())?;
            Ok(())
        }
        Commands::Receiving { session } => {
            let triple = session.triple();
            print_json(&json!({
                "receiving": prearchive.locks().is_session_receiving(&triple),
                "held": prearchive.locks().held_files(&triple),
            }))
        }
        Commands::CleanLocks { session } => {
            prearchive.locks().clean_lock_dirs(&session.triple());
            Ok(())
        }
        Commands::Stuck { minutes } => {
            print_json(&prearchive.stuck_sessions(chrono::Duration::minutes(minutes))?)
        }
        Commands::Decide {
            session,
            destination,
            auto_archive,
            overwrite,
        } => decide(&prearchive, &session, destination, auto_archive, overwrite),
        Commands::Log { command } => log(&prearchive, command),
        Commands::Timestamp { .. } => Ok(()),
    }
}

fn decide(
    prearchive: &Prearchive,
    session: &SessionArgs,
    destination: Option<String>,
    auto_archive: Option<bool>,
    overwrite: Option<bool>,
) -> CliResult {
    let triple = session.triple();
    let base = match prearchive.store().get(&triple)? {
        Some(record) => ArchiveRequest::for_record(&record),
        None => ArchiveRequest {
            project: triple.project.clone(),
            ..Default::default()
        },
    };
    let request = ArchiveRequest {
        destination,
        auto_archive_override: auto_archive,
        overwrite_override: overwrite,
        ..base
    };

    let mut metadata = RequestMetadata::new();
    let auto_archive = prearchive.is_auto_archive(&request, &mut metadata);
    let overwrite = prearchive.is_overwrite_files(&request);
    print_json(&json!({
        "session": triple.to_string(),
        "auto_archive": auto_archive,
        "overwrite": overwrite,
        "reason": metadata.reason(),
    }))
}

fn log(prearchive: &Prearchive, command: LogCommands) -> CliResult {
    let logs = prearchive.logs();
    match command {
        LogCommands::Append { session, message } => {
            println!("{}", logs.append(&session.triple(), &message)?);
        }
        LogCommands::List { session } => {
            for id in logs.list(&session.triple())? {
                println!("{id}");
            }
        }
        LogCommands::Show { session, id } => {
            println!("{}", logs.read(&session.triple(), &id)?);
        }
        LogCommands::Last { session } => {
            if let Some(entry) = logs.last(&session.triple())? {
                println!("{entry}");
            }
        }
    }
    Ok(())
}

fn timestamp(name: Option<&str>) -> CliResult {
    match name {
        Some(name) => {
            let parsed = parse_timestamp_dir(name)?;
            println!("{}", parsed.format("%Y-%m-%dT%H:%M:%S%.3f"));
        }
        None => println!("{}", make_timestamp_dir(&chrono::Local::now())),
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
