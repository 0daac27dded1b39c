use crate::config::{CertificatePaths, Config};
use crate::error::ConfigError;
use crate::logging::{ERRORS, REFRESH};
use crate::server::tls::CertificateStore;
use futures::stream::StreamExt;
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One applied difference between the live configuration and a reloaded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Field {
        field: &'static str,
        old: String,
        new: String,
    },
    Updated {
        map: &'static str,
        key: String,
        value: String,
    },
    Removed {
        map: &'static str,
        key: String,
    },
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigChange::Field { field, old, new } => {
                write!(f, "Updated {} from {} to {}", field, old, new)
            }
            ConfigChange::Updated { map, key, value } => match *map {
                "routes" => write!(f, "Updated route {} to {}", key, value),
                _ => write!(f, "Updated {} for {} to {}", map, key, value),
            },
            ConfigChange::Removed { map, key } => match *map {
                "routes" => write!(f, "Removed route {}", key),
                _ => write!(f, "Removed {} for {}", map, key),
            },
        }
    }
}

/// Owns the live [`Config`] and applies reloads to it in place.
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    base_dir: PathBuf,
    certificates: Arc<CertificateStore>,
}

impl ConfigManager {
    pub fn new(
        config: Config,
        config_path: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        certificates: Arc<CertificateStore>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.into(),
            base_dir: base_dir.into(),
            certificates,
        }
    }

    pub fn get_config(&self) -> Arc<RwLock<Config>> {
        self.config.clone()
    }

    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Merges `new_config` into the live configuration key by key.
    ///
    /// The diff is applied under a single write lock. A configuration that
    /// fails validation is rejected whole. When any certificate path
    /// component changed, the certificate store is repointed and reloaded
    /// after the lock is released; a failed certificate load keeps the
    /// previous certificate.
    pub async fn reload(&self, new_config: Config) -> Result<Vec<ConfigChange>, ConfigError> {
        new_config.validate()?;

        let (changes, new_paths) = {
            let mut live = self.config.write().await;
            let old_paths = live.certificate_paths(&self.base_dir);
            let changes = apply_diff(&mut live, &new_config);
            let new_paths = live.certificate_paths(&self.base_dir);
            (changes, (new_paths != old_paths).then_some(new_paths))
        };

        for change in &changes {
            info!(target: REFRESH, "{}", change);
            if let ConfigChange::Field { field, .. } = change {
                if field.starts_with("listen_") {
                    warn!(target: REFRESH, "{} changed; takes effect after restart", field);
                }
            }
        }

        if let Some(paths) = new_paths {
            self.repoint_certificates(paths).await;
        }

        Ok(changes)
    }

    async fn repoint_certificates(&self, paths: CertificatePaths) {
        info!(
            target: REFRESH,
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "Certificate paths changed, reloading certificate"
        );
        self.certificates.set_paths(paths);
        if let Err(e) = self.certificates.load().await {
            error!(target: ERRORS, "Failed to load certificate from new paths: {}", e);
        }
    }

    /// Reads the config file and merges it into the live configuration.
    pub async fn reload_from_disk(&self) -> Result<Vec<ConfigChange>, ConfigError> {
        let new_config = Config::load_async(&self.config_path).await?;
        self.reload(new_config).await
    }

    /// Forces a reload from disk whenever the process receives SIGHUP.
    pub fn start_reload_watcher(self: Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let mut signals = Signals::new([SIGHUP])?;

        Ok(tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                if signal == SIGHUP {
                    info!(target: REFRESH, "Received SIGHUP, reloading configuration");
                    if let Err(e) = self.reload_from_disk().await {
                        error!(target: ERRORS, "Failed to reload configuration: {}", e);
                    }
                }
            }
        }))
    }

    /// Polls the config file's modification time every `period`.
    ///
    /// A failed read or parse leaves the stamp untouched so the next tick
    /// retries.
    pub fn watch_file_changes(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_modified = modified_time(&self.config_path).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(modified) = modified_time(&self.config_path).await else {
                    continue;
                };
                if last_modified.map_or(false, |last| modified <= last) {
                    continue;
                }

                info!(target: REFRESH, "Configuration file changed, reloading...");
                match self.reload_from_disk().await {
                    Ok(changes) => {
                        if changes.is_empty() {
                            info!(target: REFRESH, "Configuration unchanged");
                        }
                        last_modified = Some(modified);
                    }
                    Err(e) => error!(target: ERRORS, "Failed to reload configuration: {}", e),
                }
            }
        })
    }
}

pub(crate) async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn apply_diff(live: &mut Config, new: &Config) -> Vec<ConfigChange> {
    let mut changes = Vec::new();

    update_field("listen_http", &mut live.listen_http, &new.listen_http, &mut changes);
    update_field("listen_https", &mut live.listen_https, &new.listen_https, &mut changes);
    update_field("cert_dir", &mut live.cert_dir, &new.cert_dir, &mut changes);
    update_field("cert_file", &mut live.cert_file, &new.cert_file, &mut changes);
    update_field("key_file", &mut live.key_file, &new.key_file, &mut changes);

    merge_map("routes", &mut live.routes, &new.routes, &mut changes);
    merge_map("trust_target", &mut live.trust_target, &new.trust_target, &mut changes);
    merge_map(
        "no_https_redirect",
        &mut live.no_https_redirect,
        &new.no_https_redirect,
        &mut changes,
    );
    merge_map("host_header", &mut live.host_header, &new.host_header, &mut changes);

    changes
}

fn update_field(
    field: &'static str,
    live: &mut String,
    new: &str,
    changes: &mut Vec<ConfigChange>,
) {
    if live != new {
        changes.push(ConfigChange::Field {
            field,
            old: std::mem::replace(live, new.to_string()),
            new: new.to_string(),
        });
    }
}

fn merge_map<V>(
    map: &'static str,
    live: &mut BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
    changes: &mut Vec<ConfigChange>,
) where
    V: Clone + PartialEq + fmt::Display,
{
    for (key, value) in new {
        if live.get(key) != Some(value) {
            live.insert(key.clone(), value.clone());
            changes.push(ConfigChange::Updated {
                map,
                key: key.clone(),
                value: value.to_string(),
            });
        }
    }

    let removed: Vec<String> = live
        .keys()
        .filter(|key| !new.contains_key(*key))
        .cloned()
        .collect();
    for key in removed {
        live.remove(&key);
        changes.push(ConfigChange::Removed { map, key });
    }
}
