//! Command line interface: aggregate an account's graph, export and import
//! follow list backups, normalize relay URLs and resend the current list.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relaygraph::{
    broadcast::BroadcastReport,
    config::Settings,
    contacts::ContactListKind,
    keys::{npub_encode, KeySigner, SchnorrVerifier, Signer, TrustSigned, Verifier},
    relay_url,
    session::{Session, SyncReport},
    transport::WsConnector,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaygraph",
    author,
    version,
    about = "Aggregate and republish a Nostr social graph across relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Query every configured relay and print what was found.
    Sync,
    /// Write the current contact list as a backup file.
    Export {
        /// Directory the backup is written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Load a backup file, optionally signing and publishing it.
    Import {
        file: PathBuf,
        /// Sign the list with `SECRET_KEY` and publish it.
        #[arg(long)]
        publish: bool,
    },
    /// Print the canonical form of relay URLs and whether they are valid.
    Normalize {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Resend the newest fetched contact list unchanged.
    Rebroadcast,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Normalize { urls } = &cli.command {
        for line in normalize_lines(urls) {
            println!("{line}");
        }
        return Ok(());
    }

    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let session = open_session(&cfg)?;
    match cli.command {
        Commands::Sync => {
            let report = session.sync().await;
            print!("{}", summary(&session, &report));
        }
        Commands::Export { out } => {
            session.sync().await;
            let id = session
                .read(|s| {
                    s.owner_list(ContactListKind::Contacts)
                        .map(|r| r.source.id.clone())
                })
                .context("no contact list found on any relay")?;
            let (name, text) = session.export(&id)?;
            fs::create_dir_all(&out)?;
            let path = out.join(name);
            fs::write(&path, text)?;
            println!("{}", path.display());
        }
        Commands::Import { file, publish } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = session.load_backup(&text, &name);
            let list = session
                .read(|s| s.version(&id).map(|v| v.list.clone()))
                .context("loaded list vanished")?;
            println!(
                "loaded {id}: {} follows, {} relays",
                list.contacts.len(),
                list.relays.len()
            );
            if publish {
                session.sync().await;
                for url in &list.relays_normalized {
                    if let Err(e) = session.add_relay(url).await {
                        tracing::warn!(relay = %url, error = %e, "skipping relay");
                    }
                }
                let published = session.publish_contacts(&id).await?;
                println!("published {}", published.event.id);
                print!("{}", report_lines(&published.report));
            }
        }
        Commands::Rebroadcast => {
            session.sync().await;
            let id = session
                .read(|s| {
                    s.latest_fetched(ContactListKind::Contacts)
                        .map(|v| v.id.clone())
                })
                .context("no contact list found on any relay")?;
            let report = session.rebroadcast(&id).await?;
            println!("rebroadcast {id}");
            print!("{}", report_lines(&report));
        }
        Commands::Normalize { .. } => unreachable!(),
    }
    Ok(())
}

fn open_session(cfg: &Settings) -> anyhow::Result<Session> {
    let connector = WsConnector {
        tor_socks: cfg.tor_socks.clone(),
        connect_timeout: Duration::from_secs(10),
        query_timeout: cfg.query_timeout,
        ack_timeout: cfg.ack_timeout,
    };
    let verifier: Arc<dyn Verifier> = if cfg.verify_sig {
        Arc::new(SchnorrVerifier)
    } else {
        Arc::new(TrustSigned)
    };
    let signer: Option<Arc<dyn Signer>> = match &cfg.secret_key {
        Some(secret) => {
            let signer = KeySigner::from_hex(secret).context("SECRET_KEY")?;
            if signer.public_key() != cfg.owner {
                bail!("SECRET_KEY does not belong to OWNER_PUBKEY");
            }
            Some(Arc::new(signer) as Arc<dyn Signer>)
        }
        None => None,
    };
    Ok(Session::new(
        cfg.session_config(),
        Arc::new(connector),
        verifier,
        signer,
    ))
}

fn normalize_lines(urls: &[String]) -> Vec<String> {
    urls.iter()
        .map(|raw| {
            let url = relay_url::normalize(raw);
            let verdict = if relay_url::is_valid_normalized(&url) {
                "valid"
            } else {
                "invalid"
            };
            format!("{url}\t{verdict}")
        })
        .collect()
}

fn summary(session: &Session, report: &SyncReport) -> String {
    let mut out = String::new();
    let owner = npub_encode(session.owner()).unwrap_or_else(|_| session.owner().to_string());
    let label = session.read(|s| {
        s.owner_profile()
            .and_then(|p| p.data.label().map(str::to_string))
    });
    match label {
        Some(label) => out.push_str(&format!("owner: {owner} ({label})\n")),
        None => out.push_str(&format!("owner: {owner}\n")),
    }
    out.push_str("relays:\n");
    for conn in &report.connections {
        out.push_str(&format!("  {} {}\n", conn.url, conn.state));
    }
    session.read(|s| {
        if let Some(list) = s.owner_list(ContactListKind::Contacts) {
            out.push_str(&format!(
                "contacts: {} follows, {} relays, seen on {} relays\n",
                list.data.contacts.len(),
                list.data.relays.len(),
                list.provenance.len()
            ));
        }
        if let Some(list) = s.owner_list(ContactListKind::Relays) {
            out.push_str(&format!(
                "relay list: {} relays, seen on {} relays\n",
                list.data.relays.len(),
                list.provenance.len()
            ));
        }
        let accepted = s.award_views().iter().filter(|v| v.accepted).count();
        out.push_str(&format!(
            "badges: {} awards, {} accepted, {} definitions\n",
            s.award_count(),
            accepted,
            s.definition_count()
        ));
        let history = s.history();
        out.push_str(&format!("history: {} versions\n", history.len()));
        for version in history {
            out.push_str(&format!(
                "  {} {} {} follows [{}]\n",
                version.id,
                version.list.created_at,
                version.list.contacts.len(),
                version
                    .provenance
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
    });
    out
}

fn report_lines(report: &BroadcastReport) -> String {
    let mut out = String::new();
    for relay in report.accepted.iter().chain(&report.seen) {
        out.push_str(&format!("  ok {relay}\n"));
    }
    for (relay, reason) in &report.failed {
        out.push_str(&format!("  failed {relay}: {reason}\n"));
    }
    for relay in &report.unreachable {
        out.push_str(&format!("  unreachable {relay}\n"));
    }
    out
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("OWNER_PUBKEY=\n");
    content.push_str("RELAYS_DEFAULT=\n");
    content.push_str("PUBLISH_MODE=registered\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("RESOLVE_BACKOFF_MS=1500\n");
    content.push_str("QUERY_TIMEOUT_MS=10000\n");
    content.push_str("ACK_TIMEOUT_MS=5000\n");
    content.push_str("AUTO_CONNECT_DISCOVERED=1\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("SECRET_KEY=\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaygraph::logging::init();
    let cli = Cli::parse();
    run(cli).await
}
