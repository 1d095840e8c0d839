use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BootstrapError;
use crate::trustee::TrusteeId;

const DEFAULT_SMTP_HOST: &str = "localhost:25";
const DEFAULT_VAULT_URL: &str = "http://127.0.0.1:8200";
const DEFAULT_KEYBASE_URL: &str = "https://keybase.io";
const DEFAULT_SECRET_THRESHOLD: u8 = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// What the run should do to the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Initialize,
    /// Rekey; `nonce` pins the run to an already active session.
    Rekey { nonce: Option<String> },
}

/// Shape of the share set. Immutable for the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    threshold: u8,
    trustees: Vec<TrusteeId>,
    cluster_name: String,
}

impl ClusterConfig {
    /// Enforces `1 <= threshold <= trustees.len()` with unique, non-empty ids.
    pub fn new(threshold: u8, trustees: Vec<TrusteeId>, cluster_name: &str) -> Result<Self> {
        if trustees.is_empty() {
            return Err(BootstrapError::config(
                "at least one trustee account is required",
            ));
        }
        if trustees.len() > u8::MAX as usize {
            return Err(BootstrapError::config(format!(
                "at most {} trustees are supported, got {}",
                u8::MAX,
                trustees.len()
            )));
        }
        if threshold == 0 {
            return Err(BootstrapError::config("secret threshold must be > 0"));
        }
        if threshold as usize > trustees.len() {
            return Err(BootstrapError::config(format!(
                "secret threshold {} exceeds trustee count {}",
                threshold,
                trustees.len()
            )));
        }
        let mut uniq = std::collections::HashSet::new();
        for t in &trustees {
            if t.0.is_empty() {
                return Err(BootstrapError::config("trustee account cannot be empty"));
            }
            if !uniq.insert(t.0.to_lowercase()) {
                return Err(BootstrapError::config(format!(
                    "duplicate trustee account: {}",
                    t.0
                )));
            }
        }
        if cluster_name.trim().is_empty() {
            return Err(BootstrapError::config("cluster name cannot be empty"));
        }
        Ok(Self {
            threshold,
            trustees,
            cluster_name: cluster_name.trim().to_string(),
        })
    }

    pub fn share_count(&self) -> u8 {
        self.trustees.len() as u8
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn trustees(&self) -> &[TrusteeId] {
        &self.trustees
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    secret_threshold: Option<u8>,
    smtp: Option<SmtpConfigFile>,
    vault: Option<VaultConfigFile>,
    keybase: Option<KeybaseConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SmtpConfigFile {
    from: Option<String>,
    host: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VaultConfigFile {
    url: Option<String>,
    cluster_name: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct KeybaseConfigFile {
    url: Option<String>,
    users: Option<Vec<String>>,
}

/// Command-line values; `None` leaves the file/env value in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub smtp_from: Option<String>,
    pub smtp_host: Option<String>,
    pub vault_url: Option<String>,
    pub keybase_url: Option<String>,
    pub keybase: Option<String>,
    pub secret_threshold: Option<u8>,
    pub cluster_name: Option<String>,
    pub timeout_secs: Option<u64>,
    pub rekey: bool,
    pub nonce: Option<String>,
    pub unseal_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub smtp_from: String,
    pub smtp_host: String,
    pub vault_url: String,
    pub keybase_url: String,
    pub keybase_users: Vec<String>,
    pub secret_threshold: u8,
    pub cluster_name: Option<String>,
    pub timeout: Duration,
    pub mode: Mode,
    pub unseal_key_file: Option<PathBuf>,
}

impl RunConfig {
    /// File (`VAULT_INIT_CONFIG`), then `VAULT_INIT_*` env, then CLI flags.
    /// Validation runs last and never touches the network.
    pub fn load(cli: CliOverrides) -> Result<Self> {
        let config_path = std::env::var("VAULT_INIT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.apply_cli(cli)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Self {
        let smtp = file.smtp.unwrap_or_default();
        let vault = file.vault.unwrap_or_default();
        let keybase = file.keybase.unwrap_or_default();
        Self {
            smtp_from: smtp.from.unwrap_or_default(),
            smtp_host: smtp.host.unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
            vault_url: vault.url.unwrap_or_else(|| DEFAULT_VAULT_URL.to_string()),
            keybase_url: keybase
                .url
                .unwrap_or_else(|| DEFAULT_KEYBASE_URL.to_string()),
            keybase_users: keybase
                .users
                .unwrap_or_default()
                .iter()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect(),
            secret_threshold: file.secret_threshold.unwrap_or(DEFAULT_SECRET_THRESHOLD),
            cluster_name: vault.cluster_name,
            timeout: Duration::from_secs(vault.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            mode: Mode::Initialize,
            unseal_key_file: None,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(from) = env_value("VAULT_INIT_SMTP_FROM") {
            self.smtp_from = from;
        }
        if let Some(host) = env_value("VAULT_INIT_SMTP_HOST") {
            self.smtp_host = host;
        }
        if let Some(url) = env_value("VAULT_INIT_VAULT_URL") {
            self.vault_url = url;
        }
        if let Some(url) = env_value("VAULT_INIT_KEYBASE_URL") {
            self.keybase_url = url;
        }
        if let Some(users) = env_value("VAULT_INIT_KEYBASE") {
            self.keybase_users = split_csv(&users);
        }
        if let Some(name) = env_value("VAULT_INIT_CLUSTER_NAME") {
            self.cluster_name = Some(name);
        }
        if let Some(threshold) = env_value("VAULT_INIT_SECRET_THRESHOLD") {
            self.secret_threshold = threshold.parse().map_err(|_| {
                BootstrapError::config("VAULT_INIT_SECRET_THRESHOLD must be an integer in 1..=255")
            })?;
        }
        if let Some(timeout) = env_value("VAULT_INIT_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                BootstrapError::config("VAULT_INIT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: CliOverrides) -> Result<()> {
        if let Some(from) = cli.smtp_from {
            self.smtp_from = from;
        }
        if let Some(host) = cli.smtp_host {
            self.smtp_host = host;
        }
        if let Some(url) = cli.vault_url {
            self.vault_url = url;
        }
        if let Some(url) = cli.keybase_url {
            self.keybase_url = url;
        }
        if let Some(users) = cli.keybase {
            self.keybase_users = split_csv(&users);
        }
        if let Some(threshold) = cli.secret_threshold {
            self.secret_threshold = threshold;
        }
        if let Some(name) = cli.cluster_name {
            self.cluster_name = Some(name);
        }
        if let Some(seconds) = cli.timeout_secs {
            self.timeout = Duration::from_secs(seconds);
        }
        if cli.unseal_key_file.is_some() {
            self.unseal_key_file = cli.unseal_key_file;
        }
        let nonce = cli.nonce.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        self.mode = match (cli.rekey, nonce) {
            (true, nonce) => Mode::Rekey { nonce },
            (false, Some(_)) => {
                return Err(BootstrapError::config(
                    "--nonce is only valid together with --rekey",
                ))
            }
            (false, None) => Mode::Initialize,
        };
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.smtp_from.trim().is_empty() {
            return Err(BootstrapError::config(
                "smtp from address is required, please provide a valid email address",
            ));
        }
        if crate::pgp::extract_email(&self.smtp_from).is_none() {
            return Err(BootstrapError::config(format!(
                "smtp from address is not an email address: {}",
                self.smtp_from
            )));
        }
        if self.smtp_host.trim().is_empty() || !self.smtp_host.contains(':') {
            return Err(BootstrapError::config(
                "smtp host must be in <host>:<port> format",
            ));
        }
        if self.keybase_users.is_empty() {
            return Err(BootstrapError::config(
                "keybase accounts are required, please provide at least one account name",
            ));
        }
        for (label, value) in [("vault", &self.vault_url), ("keybase", &self.keybase_url)] {
            let url = url::Url::parse(value).map_err(|e| {
                BootstrapError::config(format!("invalid {} url {}: {}", label, value, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(BootstrapError::config(format!(
                    "{} url must be http(s): {}",
                    label, value
                )));
            }
        }
        if self.timeout.as_secs() == 0 {
            return Err(BootstrapError::config("timeout must be greater than zero"));
        }
        // Threshold vs. trustee count is checked here too so a bad run stops
        // before the relay preflight.
        self.cluster_config()?;
        Ok(())
    }

    pub fn cluster_name(&self) -> &str {
        self.cluster_name.as_deref().unwrap_or(&self.vault_url)
    }

    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let trustees = self
            .keybase_users
            .iter()
            .map(|u| TrusteeId::new(u))
            .collect();
        ClusterConfig::new(self.secret_threshold, trustees, self.cluster_name())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BootstrapError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let cfg = serde_json::from_str(&raw).map_err(|e| {
        BootstrapError::config(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn ids(names: &[&str]) -> Vec<TrusteeId> {
        names.iter().map(|n| TrusteeId::new(n)).collect()
    }

    fn is_config_error(err: &anyhow::Error) -> bool {
        matches!(classify(err), Some(BootstrapError::Config(_)))
    }

    #[test]
    fn threshold_must_lie_between_one_and_share_count() {
        let trustees = ids(&["alice", "bob", "carol"]);
        assert!(is_config_error(
            &ClusterConfig::new(0, trustees.clone(), "c").unwrap_err()
        ));
        assert!(is_config_error(
            &ClusterConfig::new(4, trustees.clone(), "c").unwrap_err()
        ));
        let cfg = ClusterConfig::new(3, trustees, "c").unwrap();
        assert_eq!(cfg.share_count(), 3);
        assert_eq!(cfg.threshold(), 3);
    }

    #[test]
    fn trustee_list_must_be_non_empty_and_unique() {
        assert!(is_config_error(
            &ClusterConfig::new(1, vec![], "c").unwrap_err()
        ));
        assert!(is_config_error(
            &ClusterConfig::new(1, ids(&["alice", "Alice"]), "c").unwrap_err()
        ));
        assert!(is_config_error(
            &ClusterConfig::new(1, ids(&["alice", "  "]), "c").unwrap_err()
        ));
    }

    #[test]
    fn cli_overrides_win_and_nonce_requires_rekey() {
        let mut cfg = RunConfig::from_file(RunConfigFile::default());
        cfg.apply_cli(CliOverrides {
            smtp_from: Some("ops@example.com".to_string()),
            keybase: Some("alice, bob ,,carol".to_string()),
            secret_threshold: Some(2),
            ..CliOverrides::default()
        })
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.keybase_users, vec!["alice", "bob", "carol"]);
        assert_eq!(cfg.mode, Mode::Initialize);
        assert_eq!(cfg.cluster_name(), DEFAULT_VAULT_URL);

        let stray_nonce = cfg
            .apply_cli(CliOverrides {
                nonce: Some("abc".to_string()),
                ..CliOverrides::default()
            })
            .unwrap_err();
        assert!(is_config_error(&stray_nonce));

        cfg.apply_cli(CliOverrides {
            rekey: true,
            nonce: Some(" abc ".to_string()),
            ..CliOverrides::default()
        })
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(
            cfg.mode,
            Mode::Rekey {
                nonce: Some("abc".to_string())
            }
        );
    }

    #[test]
    fn missing_required_inputs_are_config_errors() {
        let mut cfg = RunConfig::from_file(RunConfigFile::default());
        cfg.keybase_users = vec!["alice".to_string()];
        cfg.secret_threshold = 1;
        assert!(is_config_error(&cfg.validate().unwrap_err()));

        cfg.smtp_from = "ops@example.com".to_string();
        cfg.keybase_users.clear();
        assert!(is_config_error(&cfg.validate().unwrap_err()));
    }
}
