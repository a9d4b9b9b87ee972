use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendanceLedger, Config, Database, Encoding, EncodingStore, OperatorRegistry, Outcome,
    SqliteAttendanceService,
};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// TOML config file (defaults to $ROLLCALL_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a face encoding
    Enroll {
        /// Unique identity key (e.g. student ID)
        #[arg(short, long)]
        key: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Optional group, such as a department
        #[arg(short, long)]
        group: Option<String>,
        /// JSON array of numbers, read from a file or "-" for stdin
        #[arg(short, long)]
        encoding: String,
    },
    /// Match a probe encoding and record attendance
    Submit {
        /// JSON array of numbers, read from a file or "-" for stdin
        #[arg(short, long)]
        encoding: String,
        /// RFC 3339 timestamp to record (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
    /// List enrolled identities
    Identities,
    /// Show attendance events, newest first
    History {
        /// Only show events for this identity
        #[arg(short, long)]
        identity: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage operator accounts
    Operator {
        #[command(subcommand)]
        command: OperatorCommand,
    },
    /// Export the attendance report as JSON (password read from stdin)
    Export {
        #[arg(short, long)]
        username: String,
        /// Only export events for this identity
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Show database and matcher status
    Status,
}

#[derive(Subcommand)]
enum OperatorCommand {
    /// Add an operator (password read from stdin)
    Add {
        #[arg(short, long)]
        username: String,
    },
    /// List operator usernames
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    tracing::debug!(db = %config.db_path.display(), "configuration loaded");
    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let service = SqliteAttendanceService::from_config(db.clone(), &config)?;

    match cli.command {
        Commands::Enroll {
            key,
            name,
            group,
            encoding,
        } => {
            let encoding = read_encoding(&encoding)?;
            let identity = service.enroll(&key, &name, group.as_deref(), encoding)?;
            println!(
                "Enrolled {} ({}) with a {}-dimensional encoding",
                identity.display_name,
                identity.identity_key,
                identity.encoding.dimension()
            );
        }
        Commands::Submit { encoding, at } => {
            let probe = read_encoding(&encoding)?;
            let timestamp = match at {
                Some(at) => parse_timestamp(&at)?,
                None => Utc::now(),
            };
            match service.submit(&probe, timestamp)? {
                Outcome::Recorded {
                    identity,
                    event,
                    distance,
                } => println!(
                    "Attendance marked for {} at {} (distance {distance:.4})",
                    identity.display_name,
                    event.timestamp.to_rfc3339()
                ),
                Outcome::SuppressedDuplicate { identity, distance } => println!(
                    "Already marked for {} in this window (distance {distance:.4})",
                    identity.display_name
                ),
                Outcome::NoMatchFound => println!("Face not recognized"),
            }
        }
        Commands::Identities => {
            let identities = service.store().all()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}\t{}\t{}\t{}",
                    identity.identity_key,
                    identity.display_name,
                    identity.group_attribute.as_deref().unwrap_or("-"),
                    identity.enrolled_at.to_rfc3339()
                );
            }
        }
        Commands::History { identity, json } => {
            let events = service.history(identity.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No attendance recorded");
            } else {
                for event in events {
                    println!("{}\t{}", event.timestamp.to_rfc3339(), event.identity_key);
                }
            }
        }
        Commands::Operator { command } => {
            let operators = OperatorRegistry::new(db);
            match command {
                OperatorCommand::Add { username } => {
                    let password = read_password()?;
                    operators.add(&username, &password)?;
                    println!("Operator {username} added");
                }
                OperatorCommand::List => {
                    for name in operators.list()? {
                        println!("{name}");
                    }
                }
            }
        }
        Commands::Export { username, identity } => {
            let password = read_password()?;
            let access = OperatorRegistry::new(db).authenticate(&username, &password)?;
            let rows = service.export(&access, identity.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Status => {
            let store = service.store();
            println!("rollcall {}", env!("CARGO_PKG_VERSION"));
            println!("database:   {}", config.db_path.display());
            println!("identities: {}", store.count()?);
            match store.dimension()? {
                Some(d) => println!("dimension:  {d}"),
                None => println!("dimension:  not established"),
            }
            println!("threshold:  {}", service.matcher().threshold());
            println!("window:     {}", service.ledger().window().describe());
        }
    }

    Ok(())
}

/// Read a JSON encoding from a file path, or stdin when `source` is "-".
fn read_encoding(source: &str) -> Result<Encoding> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading {source}"))?
    };
    parse_encoding(&text)
}

fn parse_encoding(text: &str) -> Result<Encoding> {
    serde_json::from_str(text.trim())
        .context("encoding must be a non-empty JSON array of finite numbers")
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC 3339 timestamp {s:?}"))?
        .with_timezone(&Utc))
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given on stdin");
    }
    Ok(password)
}
