use crate::config::CertificatePaths;
use crate::config_reload::modified_time;
use crate::error::CertificateError;
use crate::logging::{ERRORS, REFRESH};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamps {
    cert: Option<SystemTime>,
    key: Option<SystemTime>,
}

/// Holds the active certificate and swaps it atomically on reload.
///
/// The TLS layer resolves the certificate once per handshake through
/// [`ResolvesServerCert`], so a swap only affects handshakes that start
/// after it.
#[derive(Debug)]
pub struct CertificateStore {
    current: RwLock<Arc<CertifiedKey>>,
    paths: RwLock<CertificatePaths>,
    loaded_stamps: RwLock<FileStamps>,
}

impl CertificateStore {
    /// Loads the initial pair. Startup treats a failure here as fatal.
    pub async fn load_from(paths: CertificatePaths) -> Result<Self, CertificateError> {
        let stamps = read_stamps(&paths).await;
        let key = read_certified_key(&paths).await?;

        info!(target: REFRESH, "Loaded TLS certificate from {}", paths.cert.display());

        Ok(Self {
            current: RwLock::new(Arc::new(key)),
            paths: RwLock::new(paths),
            loaded_stamps: RwLock::new(stamps),
        })
    }

    pub fn paths(&self) -> CertificatePaths {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_paths(&self, paths: CertificatePaths) {
        *self.paths.write().unwrap_or_else(PoisonError::into_inner) = paths;
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hex SHA-256 of the active leaf certificate.
    pub fn current_fingerprint(&self) -> String {
        let key = self.current();
        key.cert
            .first()
            .map(|leaf| format!("{:x}", Sha256::digest(leaf.as_ref())))
            .unwrap_or_default()
    }

    /// Re-reads the certificate and key from the configured paths.
    ///
    /// On failure the previous certificate stays active.
    pub async fn load(&self) -> Result<(), CertificateError> {
        let paths = self.paths();
        let stamps = read_stamps(&paths).await;
        let key = read_certified_key(&paths).await?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(key);
        *self
            .loaded_stamps
            .write()
            .unwrap_or_else(PoisonError::into_inner) = stamps;

        info!(target: REFRESH, "Reloaded TLS certificate from {}", paths.cert.display());
        Ok(())
    }

    /// Reloads when either file's modification time differs from the last
    /// successful load. Returns whether a reload was attempted.
    pub async fn reload_if_changed(&self) -> bool {
        let paths = self.paths();
        let stamps = read_stamps(&paths).await;
        let loaded = *self
            .loaded_stamps
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if stamps == loaded || stamps.cert.is_none() || stamps.key.is_none() {
            return false;
        }

        info!(target: REFRESH, "Certificate files changed, reloading...");
        if let Err(e) = self.load().await {
            error!(target: ERRORS, "Failed to reload certificate, keeping the previous one: {}", e);
        }
        true
    }

    /// Polls the certificate and key files every `period`.
    pub fn watch(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                self.reload_if_changed().await;
            }
        })
    }

    /// Builds a TLS acceptor that resolves certificates through this store.
    pub fn acceptor(self: &Arc<Self>) -> TlsAcceptor {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsAcceptor::from(Arc::new(config))
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

async fn read_stamps(paths: &CertificatePaths) -> FileStamps {
    FileStamps {
        cert: modified_time(&paths.cert).await,
        key: modified_time(&paths.key).await,
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_certified_key(paths: &CertificatePaths) -> Result<CertifiedKey, CertificateError> {
    let cert_pem = read_file(&paths.cert).await?;
    let key_pem = read_file(&paths.key).await?;

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|source| CertificateError::Read {
            path: paths.cert.clone(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificate(paths.cert.clone()));
    }

    let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| CertificateError::Read {
            path: paths.key.clone(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey(paths.key.clone()))?;

    let signing_key =
        any_supported_type(&private_key).map_err(|source| CertificateError::InvalidKey {
            path: paths.key.clone(),
            source,
        })?;

    // The leaf must parse and carry the private key's public half.
    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|source| CertificateError::KeyMismatch {
            path: paths.cert.clone(),
            source,
        })?;

    Ok(certified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl_cert_gen::CertificateGenerator;
    use tempfile::TempDir;

    fn paths_in(dir: &TempDir, name: &str) -> CertificatePaths {
        CertificatePaths {
            cert: dir.path().join(name).join("certificate.pem"),
            key: dir.path().join(name).join("key.pem"),
        }
    }

    #[tokio::test]
    async fn test_load_missing_files_fails() {
        let dir = TempDir::new().unwrap();
        let result = CertificateStore::load_from(paths_in(&dir, "absent")).await;
        assert!(matches!(result, Err(CertificateError::Read { .. })));
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_previous_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir, "live");
        CertificateGenerator::ensure_certificates_exist(&paths, &[])
            .await
            .unwrap();

        let store = CertificateStore::load_from(paths.clone()).await.unwrap();
        let before = store.current_fingerprint();

        std::fs::write(&paths.cert, "-----BEGIN CERTIFICATE-----\ngarbage\n").unwrap();
        assert!(store.load().await.is_err());
        assert_eq!(store.current_fingerprint(), before);

        std::fs::write(&paths.key, "not a key").unwrap();
        assert!(store.load().await.is_err());
        assert_eq!(store.current_fingerprint(), before);
    }

    #[tokio::test]
    async fn test_load_rejects_certificate_from_another_pair() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir, "live");
        let other = paths_in(&dir, "other");
        CertificateGenerator::ensure_certificates_exist(&paths, &[])
            .await
            .unwrap();
        CertificateGenerator::ensure_certificates_exist(&other, &[])
            .await
            .unwrap();

        let store = CertificateStore::load_from(paths.clone()).await.unwrap();
        let before = store.current_fingerprint();

        // Certificate rotated, key not yet.
        std::fs::copy(&other.cert, &paths.cert).unwrap();
        let result = store.load().await;
        assert!(matches!(result, Err(CertificateError::KeyMismatch { .. })));
        assert_eq!(store.current_fingerprint(), before);

        std::fs::copy(&other.key, &paths.key).unwrap();
        store.load().await.unwrap();
        assert_ne!(store.current_fingerprint(), before);
    }

    #[tokio::test]
    async fn test_load_rejects_undecodable_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir, "live");
        CertificateGenerator::ensure_certificates_exist(&paths, &[])
            .await
            .unwrap();

        let store = CertificateStore::load_from(paths.clone()).await.unwrap();
        let before = store.current_fingerprint();

        std::fs::write(
            &paths.cert,
            "-----BEGIN CERTIFICATE-----\nAAAAAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        assert!(store.load().await.is_err());
        assert_eq!(store.current_fingerprint(), before);

        let fresh = CertificateStore::load_from(paths).await;
        assert!(matches!(fresh, Err(CertificateError::KeyMismatch { .. })));
    }

    #[tokio::test]
    async fn test_reload_if_changed_swaps_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir, "live");
        let replacement = paths_in(&dir, "next");
        CertificateGenerator::ensure_certificates_exist(&paths, &[])
            .await
            .unwrap();
        CertificateGenerator::ensure_certificates_exist(&replacement, &[])
            .await
            .unwrap();

        let store = CertificateStore::load_from(paths.clone()).await.unwrap();
        let before = store.current_fingerprint();
        assert!(!store.reload_if_changed().await);

        // Make sure the new mtime is observable on coarse filesystems.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::copy(&replacement.cert, &paths.cert).unwrap();
        std::fs::copy(&replacement.key, &paths.key).unwrap();

        assert!(store.reload_if_changed().await);
        assert_ne!(store.current_fingerprint(), before);
        assert!(!store.reload_if_changed().await);
    }

    #[tokio::test]
    async fn test_watch_retries_until_pair_is_complete() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir, "live");
        let next = paths_in(&dir, "next");
        CertificateGenerator::ensure_certificates_exist(&paths, &[])
            .await
            .unwrap();
        CertificateGenerator::ensure_certificates_exist(&next, &[])
            .await
            .unwrap();

        let store = Arc::new(CertificateStore::load_from(paths.clone()).await.unwrap());
        let before = store.current_fingerprint();
        let watcher = store.clone().watch(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::copy(&next.cert, &paths.cert).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.current_fingerprint(), before);

        std::fs::copy(&next.key, &paths.key).unwrap();
        let mut swapped = false;
        for _ in 0..50 {
            if store.current_fingerprint() != before {
                swapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        watcher.abort();
        assert!(swapped);
    }
}
