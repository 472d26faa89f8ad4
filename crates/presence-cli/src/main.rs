use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, Utc};
use clap::{Parser, Subcommand};
use presence_core::{AttendanceLedger, EmbeddingStore, Identity, Session};
use presence_store::{EmbeddingCipher, SqliteStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance tracking CLI")]
struct Cli {
    /// Database path (defaults to PRESENCE_DB_PATH, then the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Key file used to encrypt stored embeddings (defaults to PRESENCE_KEY_FILE)
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema if missing
    InitDb,
    /// Show registry and attendance statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List registered identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// List attendance sessions, most recent first
    Sessions {
        /// Only sessions without a check-out
        #[arg(long)]
        open: bool,
        /// Only sessions of this identity
        #[arg(long)]
        identity: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Name an identity (an empty name clears it)
    Label {
        id: i64,
        name: String,
        /// Write the database directly instead of going through the daemon
        #[arg(long)]
        offline: bool,
    },
    /// Check an identity out now
    Depart { id: i64 },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    fn status(&self) -> zbus::Result<String>;
    fn stats(&self) -> zbus::Result<String>;
    fn depart(&self, identity_id: i64) -> zbus::Result<String>;
    fn label(&self, identity_id: i64, name: &str) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let path = db_path(&cli.db);
            open_store(&cli.db, &cli.key_file)?;
            println!("Database ready: {}", path.display());
        }
        Commands::Stats { json } => {
            let store = open_store(&cli.db, &cli.key_file)?;
            let stats = presence_core::stats(&store)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "Identities:      {} ({} named)",
                    stats.identities, stats.named_identities
                );
                println!("Total visits:    {}", stats.total_visits);
                println!("Sessions:        {} ({} open)", stats.sessions, stats.open_sessions);
                match stats.mean_session_secs {
                    Some(secs) => println!("Mean session:    {}", format_secs(secs)),
                    None => println!("Mean session:    -"),
                }
            }
        }
        Commands::List { json } => {
            let store = open_store(&cli.db, &cli.key_file)?;
            let identities = store.all()?;
            if json {
                let rows: Vec<_> = identities.iter().map(identity_json).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if identities.is_empty() {
                println!("No identities registered");
            } else {
                println!(
                    "{:>6}  {:<20} {:>6}  {:<19}  {:<19}",
                    "ID", "LABEL", "VISITS", "REGISTERED", "LAST SEEN"
                );
                for identity in &identities {
                    println!(
                        "{:>6}  {:<20} {:>6}  {:<19}  {:<19}",
                        identity.identity_id,
                        identity.label(),
                        identity.visit_count,
                        format_time(identity.registered_at),
                        format_time(identity.last_seen_at),
                    );
                }
            }
        }
        Commands::Sessions {
            open,
            identity,
            limit,
            json,
        } => {
            let store = open_store(&cli.db, &cli.key_file)?;
            let sessions = select_sessions(&store, open, identity, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions");
            } else {
                println!(
                    "{:>6}  {:>8}  {:<19}  {:<19}  {:>9}",
                    "ID", "IDENTITY", "CHECK-IN", "CHECK-OUT", "DURATION"
                );
                for session in &sessions {
                    println!(
                        "{:>6}  {:>8}  {:<19}  {:<19}  {:>9}",
                        session.session_id,
                        session.identity_id,
                        format_time(session.check_in),
                        session.check_out.map(format_time).unwrap_or_else(|| "open".into()),
                        session.duration().map(format_duration).unwrap_or_else(|| "-".into()),
                    );
                }
            }
        }
        Commands::Label { id, name, offline } => {
            if offline {
                let mut store = open_store(&cli.db, &cli.key_file)?;
                let mut identity = store
                    .get(id)?
                    .with_context(|| format!("unknown identity {id}"))?;
                identity.display_name = (!name.trim().is_empty()).then(|| name.trim().to_string());
                store.upsert(&identity)?;
                println!("Identity {id} is now {}", identity.label());
            } else {
                let proxy = connect(cli.system).await?;
                let reply = proxy.label(id, &name).await?;
                print_reply(&reply)?;
            }
        }
        Commands::Depart { id } => {
            let proxy = connect(cli.system).await?;
            let reply = proxy.depart(id).await?;
            print_reply(&reply)?;
        }
        Commands::Status => match connect(cli.system).await {
            Ok(proxy) => print_reply(&proxy.status().await?)?,
            Err(e) => {
                tracing::debug!(error = %e, "daemon connection failed");
                println!("presenced: not connected");
            }
        },
    }

    Ok(())
}

fn db_path(db: &Option<PathBuf>) -> PathBuf {
    db.clone()
        .or_else(|| std::env::var_os("PRESENCE_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(presence_store::default_db_path)
}

fn open_store(db: &Option<PathBuf>, key_file: &Option<PathBuf>) -> Result<SqliteStore> {
    let key_file = key_file
        .clone()
        .or_else(|| std::env::var_os("PRESENCE_KEY_FILE").map(PathBuf::from));
    let cipher = match key_file {
        Some(path) => Some(EmbeddingCipher::from_key_file(&path)?),
        None => None,
    };
    let path = db_path(db);
    SqliteStore::open(&path, cipher).with_context(|| format!("opening database {}", path.display()))
}

async fn connect(system: bool) -> Result<PresenceProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    PresenceProxy::new(&conn)
        .await
        .context("presenced is not reachable on D-Bus")
}

fn select_sessions<L: AttendanceLedger>(
    ledger: &L,
    open: bool,
    identity: Option<i64>,
    limit: usize,
) -> Result<Vec<Session>> {
    if limit == 0 {
        bail!("--limit must be positive");
    }
    let mut sessions = match (open, identity) {
        (true, _) => ledger.open_sessions()?,
        (false, Some(id)) => ledger.sessions_for(id)?,
        (false, None) => return Ok(ledger.recent_sessions(limit)?),
    };
    if let Some(id) = identity {
        sessions.retain(|s| s.identity_id == id);
    }
    sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
    sessions.truncate(limit);
    Ok(sessions)
}

fn print_reply(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn identity_json(identity: &Identity) -> serde_json::Value {
    serde_json::json!({
        "identity_id": identity.identity_id,
        "label": identity.label(),
        "display_name": identity.display_name,
        "visit_count": identity.visit_count,
        "registered_at": identity.registered_at,
        "last_seen_at": identity.last_seen_at,
        "embedding_dim": identity.reference_embedding.dim(),
    })
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn format_secs(secs: f64) -> String {
    format_duration(Duration::milliseconds((secs * 1000.0) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{MemoryStore, SessionEvent};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::seconds(300)), "5m00s");
        assert_eq!(format_duration(Duration::seconds(3723)), "1h02m03s");
        assert_eq!(format_duration(Duration::seconds(-5)), "0s");
        assert_eq!(format_secs(90.4), "1m30s");
    }

    fn ledger() -> MemoryStore {
        let mut store = MemoryStore::new();
        let t0 = Utc::now();
        for (session_id, identity_id) in [(1, 1), (2, 2), (3, 1)] {
            store
                .record(&SessionEvent::Opened {
                    session_id,
                    identity_id,
                    check_in: t0 + Duration::seconds(session_id),
                })
                .unwrap();
        }
        store
            .record(&SessionEvent::Closed {
                session_id: 1,
                identity_id: 1,
                check_out: t0 + Duration::seconds(10),
                duration: Duration::seconds(9),
            })
            .unwrap();
        store
    }

    #[test]
    fn test_select_sessions() {
        let store = ledger();

        let recent = select_sessions(&store, false, None, 2).unwrap();
        assert_eq!(recent.iter().map(|s| s.session_id).collect::<Vec<_>>(), vec![3, 2]);

        let of_one = select_sessions(&store, false, Some(1), 10).unwrap();
        assert_eq!(of_one.iter().map(|s| s.session_id).collect::<Vec<_>>(), vec![3, 1]);

        let open_of_one = select_sessions(&store, true, Some(1), 10).unwrap();
        assert_eq!(open_of_one.len(), 1);
        assert_eq!(open_of_one[0].session_id, 3);

        assert!(select_sessions(&store, false, None, 0).is_err());
    }
}
