use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use facet::Facet;

use crate::error::FleetError;
use crate::retry::RetryPolicy;
use crate::util;

// ── ProviderKind ──────────────────────────────────────────

/// Which external tool provisions instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Multipass,
    Orb,
}

impl FromStr for ProviderKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multipass" => Ok(ProviderKind::Multipass),
            "orb" | "orbstack" => Ok(ProviderKind::Orb),
            other => Err(FleetError::Configuration {
                message: format!("unknown provider '{other}' (use multipass or orb)"),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Multipass => "multipass",
            ProviderKind::Orb => "orb",
        })
    }
}

// ── Settings sections ─────────────────────────────────────

/// Resource template applied when `run` gets no explicit sizing.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DefaultsConfig {
    #[facet(default = "2")]
    pub cpus: String,
    #[facet(default = "4G")]
    pub memory: String,
    #[facet(default = "50G")]
    pub disk: String,
    #[facet(default)]
    pub image: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            cpus: "2".into(),
            memory: "4G".into(),
            disk: "50G".into(),
            image: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NetworkConfig {
    #[facet(default)]
    pub proxy: String,
    #[facet(default)]
    pub no_proxy: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "root")]
    pub user: String,
    #[facet(default = 22)]
    pub port: u16,
    #[facet(default)]
    pub public_key: String,
    #[facet(default)]
    pub private_key: String,
    #[facet(default)]
    pub passphrase: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            public_key: String::new(),
            private_key: String::new(),
            passphrase: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimingConfig {
    #[facet(default = 900)]
    pub command_timeout_secs: u64,
    #[facet(default = 1000)]
    pub create_stagger_ms: u64,
    #[facet(default = 100)]
    pub apply_stagger_ms: u64,
    #[facet(default = 5)]
    pub sync_attempts: u32,
    #[facet(default = 2000)]
    pub sync_backoff_ms: u64,
    #[facet(default = 6)]
    pub ready_attempts: u32,
    #[facet(default = 5000)]
    pub ready_interval_ms: u64,
    #[facet(default = 8)]
    pub max_parallel: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 900,
            create_stagger_ms: 1000,
            apply_stagger_ms: 100,
            sync_attempts: 5,
            sync_backoff_ms: 2000,
            ready_attempts: 6,
            ready_interval_ms: 5000,
            max_parallel: 8,
        }
    }
}

impl TimingConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn create_stagger(&self) -> Duration {
        Duration::from_millis(self.create_stagger_ms)
    }

    pub fn apply_stagger(&self) -> Duration {
        Duration::from_millis(self.apply_stagger_ms)
    }

    pub fn sync_retry(&self) -> RetryPolicy {
        RetryPolicy::backoff(self.sync_attempts, Duration::from_millis(self.sync_backoff_ms))
    }

    pub fn ready_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.ready_attempts, Duration::from_millis(self.ready_interval_ms))
    }

    /// Zero delays and single-digit budgets, for tests.
    pub fn immediate() -> Self {
        Self {
            command_timeout_secs: 5,
            create_stagger_ms: 0,
            apply_stagger_ms: 0,
            sync_attempts: 2,
            sync_backoff_ms: 0,
            ready_attempts: 2,
            ready_interval_ms: 0,
            max_parallel: 8,
        }
    }
}

// ── Settings ──────────────────────────────────────────────

/// Everything read from `<root>/etc/config.toml`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Settings {
    #[facet(default = "multipass")]
    pub provider: String,
    #[facet(default)]
    pub defaults: DefaultsConfig,
    #[facet(default)]
    pub network: NetworkConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub timing: TimingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "multipass".into(),
            defaults: DefaultsConfig::default(),
            network: NetworkConfig::default(),
            ssh: SshConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Settings {
    pub fn provider_kind(&self) -> Result<ProviderKind, FleetError> {
        self.provider.parse()
    }
}

// ── public API ────────────────────────────────────────────

/// Load settings from `path`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, FleetError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(source) => {
            return Err(FleetError::Io {
                context: format!("failed to read settings from {}", path.display()),
                source,
            });
        }
    };

    let settings: Settings =
        facet_toml::from_str(&contents).map_err(|e| FleetError::Configuration {
            message: format!("failed to parse {}: {e}", path.display()),
        })?;

    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<(), FleetError> {
    settings.provider_kind()?;

    let cpus: u32 = settings
        .defaults
        .cpus
        .parse()
        .map_err(|_| FleetError::Configuration {
            message: format!("defaults.cpus must be an integer (got '{}')", settings.defaults.cpus),
        })?;
    if cpus < 1 {
        return Err(FleetError::Configuration {
            message: "defaults.cpus must be at least 1".into(),
        });
    }
    util::parse_size(&settings.defaults.memory)?;
    util::parse_size(&settings.defaults.disk)?;

    if settings.timing.max_parallel == 0 {
        return Err(FleetError::Configuration {
            message: "timing.max_parallel must be at least 1".into(),
        });
    }
    if settings.timing.sync_attempts == 0 || settings.timing.ready_attempts == 0 {
        return Err(FleetError::Configuration {
            message: "retry budgets must be at least 1 attempt".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, toml: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(s.provider_kind().unwrap(), ProviderKind::Multipass);
        assert_eq!(s.defaults.cpus, "2");
        assert_eq!(s.defaults.memory, "4G");
        assert_eq!(s.ssh.port, 22);
        assert_eq!(s.timing.ready_attempts, 6);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "provider = \"orb\"\n\n[defaults]\ncpus = \"4\"\n\n[network]\nproxy = \"10.0.0.1:3128\"\n",
        );
        let s = load_settings(&path).unwrap();
        assert_eq!(s.provider_kind().unwrap(), ProviderKind::Orb);
        assert_eq!(s.defaults.cpus, "4");
        assert_eq!(s.defaults.disk, "50G");
        assert_eq!(s.network.proxy, "10.0.0.1:3128");
        assert_eq!(s.timing.sync_attempts, 5);
    }

    #[test]
    fn rejects_unknown_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "provider = \"virtualbox\"\n");
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn rejects_bad_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[defaults]\nmemory = \"lots\"\n");
        assert!(load_settings(&path).is_err());
        let path = write(&dir, "[defaults]\ncpus = \"0\"\n");
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn provider_names() {
        assert_eq!("Multipass".parse::<ProviderKind>().unwrap(), ProviderKind::Multipass);
        assert_eq!("orbstack".parse::<ProviderKind>().unwrap(), ProviderKind::Orb);
        assert_eq!(ProviderKind::Orb.to_string(), "orb");
    }
}
