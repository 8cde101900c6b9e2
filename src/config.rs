//! Configuration loading from `.env` files.

use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::{broadcast::PublishMode, keys::parse_pubkey, session::SessionConfig};

/// Relays opened when `RELAYS_DEFAULT` is not set.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.current.fyi",
    "wss://brb.io",
    "wss://eden.nostr.land",
    "wss://nostr.fmt.wiz.biz",
    "wss://relay.nostr.info",
    "wss://nostr.zebedee.cloud",
    "wss://nostr-pub.wellorder.net",
    "wss://relay.snort.social",
    "wss://nostr-pub.semisol.dev",
    "wss://nostr.oxtr.dev",
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Hex public key whose graph is aggregated.
    pub owner: String,
    /// Relays opened on sync.
    pub relays: Vec<String>,
    pub publish_mode: PublishMode,
    /// Check Schnorr signatures on merge.
    pub verify_sig: bool,
    /// Pause between resolution rounds.
    pub resolve_backoff: Duration,
    /// How long a query waits for `EOSE`.
    pub query_timeout: Duration,
    /// How long a publish waits for `OK`.
    pub ack_timeout: Duration,
    /// Open relays named in the owner's lists.
    pub auto_connect_discovered: bool,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Optional hex secret key for signing.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let owner_raw = env::var("OWNER_PUBKEY").context("OWNER_PUBKEY is not set")?;
        let owner = parse_pubkey(&owner_raw).context("OWNER_PUBKEY")?;
        let relays = match env::var("RELAYS_DEFAULT") {
            Ok(s) if !s.trim().is_empty() => csv_strings(s),
            _ => DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
        };
        let publish_mode = match env::var("PUBLISH_MODE") {
            Ok(s) if !s.trim().is_empty() => PublishMode::from_str(&s).context("PUBLISH_MODE")?,
            _ => PublishMode::default(),
        };
        let verify_sig = flag("VERIFY_SIG", true);
        let auto_connect_discovered = flag("AUTO_CONNECT_DISCOVERED", true);
        let resolve_backoff = millis("RESOLVE_BACKOFF_MS", 1500)?;
        let query_timeout = millis("QUERY_TIMEOUT_MS", 10_000)?;
        let ack_timeout = millis("ACK_TIMEOUT_MS", 5_000)?;
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        Ok(Self {
            owner,
            relays,
            publish_mode,
            verify_sig,
            resolve_backoff,
            query_timeout,
            ack_timeout,
            auto_connect_discovered,
            tor_socks,
            secret_key,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            owner: self.owner.clone(),
            relays: self.relays.clone(),
            publish_mode: self.publish_mode,
            resolve_backoff: self.resolve_backoff,
            auto_connect_discovered: self.auto_connect_discovered,
        }
    }
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim() == "1",
        _ => default,
    }
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            let ms: u64 = v.trim().parse().with_context(|| format!("{name}={v}"))?;
            Ok(Duration::from_millis(ms))
        }
        _ => Ok(Duration::from_millis(default)),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "OWNER_PUBKEY",
        "RELAYS_DEFAULT",
        "PUBLISH_MODE",
        "VERIFY_SIG",
        "RESOLVE_BACKOFF_MS",
        "QUERY_TIMEOUT_MS",
        "ACK_TIMEOUT_MS",
        "AUTO_CONNECT_DISCOVERED",
        "TOR_SOCKS",
        "SECRET_KEY",
    ];

    fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    const OWNER: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    fn load(content: &str) -> Result<Settings> {
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, content).unwrap();
        Settings::from_env(env_path.to_str().unwrap())
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        let cfg = load(&format!(
            concat!(
                "OWNER_PUBKEY={}\n",
                "RELAYS_DEFAULT=wss://r1, r2\n",
                "PUBLISH_MODE=all\n",
                "VERIFY_SIG=0\n",
                "RESOLVE_BACKOFF_MS=250\n",
                "QUERY_TIMEOUT_MS=3000\n",
                "ACK_TIMEOUT_MS=1000\n",
                "AUTO_CONNECT_DISCOVERED=0\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
            ),
            OWNER
        ))
        .unwrap();
        assert_eq!(cfg.owner, OWNER);
        assert_eq!(cfg.relays, vec!["wss://r1", "r2"]);
        assert_eq!(cfg.publish_mode, PublishMode::All);
        assert!(!cfg.verify_sig);
        assert!(!cfg.auto_connect_discovered);
        assert_eq!(cfg.resolve_backoff, Duration::from_millis(250));
        assert_eq!(cfg.query_timeout, Duration::from_secs(3));
        assert_eq!(cfg.ack_timeout, Duration::from_secs(1));
        assert_eq!(cfg.tor_socks.as_deref(), Some("127.0.0.1:9050"));
        assert!(cfg.secret_key.is_none());
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        let npub = crate::keys::npub_encode(OWNER).unwrap();
        let cfg = load(&format!("OWNER_PUBKEY={npub}\nTOR_SOCKS=\nRELAYS_DEFAULT=\n")).unwrap();
        assert_eq!(cfg.owner, OWNER);
        assert_eq!(cfg.relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(cfg.publish_mode, PublishMode::Registered);
        assert!(cfg.verify_sig);
        assert!(cfg.auto_connect_discovered);
        assert_eq!(cfg.resolve_backoff, Duration::from_millis(1500));
        assert_eq!(cfg.query_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ack_timeout, Duration::from_secs(5));
        assert!(cfg.tor_socks.is_none());

        let session = cfg.session_config();
        assert_eq!(session.owner, OWNER);
        assert_eq!(session.relays, cfg.relays);
    }

    #[test]
    fn missing_or_bad_owner_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        assert!(load("RELAYS_DEFAULT=wss://r1\n").is_err());
        assert!(load("OWNER_PUBKEY=alice\n").is_err());
    }

    #[test]
    fn bad_values_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        assert!(load(&format!("OWNER_PUBKEY={OWNER}\nPUBLISH_MODE=everyone\n")).is_err());
        assert!(load(&format!("OWNER_PUBKEY={OWNER}\nACK_TIMEOUT_MS=soon\n")).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
