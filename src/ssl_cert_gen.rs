use crate::config::CertificatePaths;
use crate::error::CertificateError;
use chrono::{Datelike, Months, NaiveDate, Utc};
use pkcs8::PrivateKeyInfo;
use rcgen::{
    date_time_ymd, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256,
};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Always included in the SAN list of generated certificates.
pub const DEFAULT_SAN: &str = "localhost";

/// A freshly generated certificate and its PKCS#1 key, both PEM encoded.
pub struct GeneratedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Generates a self-signed pair when either file is missing.
    ///
    /// Returns `true` when new files were written.
    pub async fn ensure_certificates_exist(
        paths: &CertificatePaths,
        domains: &[String],
    ) -> Result<bool, CertificateError> {
        if paths.cert.exists() && paths.key.exists() {
            info!(
                "TLS certificate found at {} and {}",
                paths.cert.display(),
                paths.key.display()
            );
            return Ok(false);
        }

        warn!("TLS certificate not found, generating a self-signed certificate");

        let paths = paths.clone();
        let domains = domains.to_vec();
        tokio::task::spawn_blocking(move || Self::write_self_signed_cert(&paths, &domains))
            .await
            .map_err(|e| CertificateError::Generate(e.to_string()))??;

        Ok(true)
    }

    fn write_self_signed_cert(
        paths: &CertificatePaths,
        domains: &[String],
    ) -> Result<(), CertificateError> {
        for parent in [paths.cert.parent(), paths.key.parent()].into_iter().flatten() {
            create_cert_dir(parent)?;
        }

        let generated = Self::generate_self_signed_cert(domains)?;

        fs::write(&paths.cert, generated.cert_pem.as_bytes())?;
        write_private_key(&paths.key, generated.key_pem.as_bytes())?;

        info!(
            "Generated self-signed certificate at {}",
            paths.cert.display()
        );
        warn!("Using a self-signed certificate. Replace it with a CA-issued certificate for production.");

        Ok(())
    }

    /// Builds an RSA-2048 self-signed certificate valid for one year.
    pub fn generate_self_signed_cert(
        domains: &[String],
    ) -> Result<GeneratedCertificate, CertificateError> {
        let mut names = vec![DEFAULT_SAN.to_string()];
        for domain in domains {
            if !names.contains(domain) {
                names.push(domain.clone());
            }
        }

        let mut params = CertificateParams::new(names)?;

        let mut subject = DistinguishedName::new();
        subject.push(DnType::OrganizationName, "tlsgate Self-Signed");
        subject.push(DnType::CommonName, DEFAULT_SAN);
        params.distinguished_name = subject;

        let today = Utc::now().date_naive();
        let expiry = today
            .checked_add_months(Months::new(12))
            .ok_or_else(|| CertificateError::Generate("validity overflows the calendar".into()))?;
        let asn1_date = |d: NaiveDate| date_time_ymd(d.year(), d.month() as u8, d.day() as u8);
        params.not_before = asn1_date(today);
        params.not_after = asn1_date(expiry);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        let cert = params.self_signed(&key_pair)?;

        Ok(GeneratedCertificate {
            cert_pem: cert.pem(),
            key_pem: rsa_key_pem(&key_pair)?,
        })
    }
}

/// Unwraps the PKCS#8 container into a PKCS#1 `RSA PRIVATE KEY` block.
fn rsa_key_pem(key_pair: &KeyPair) -> Result<String, CertificateError> {
    let pkcs8_der = key_pair.serialize_der();
    let info = PrivateKeyInfo::try_from(pkcs8_der.as_slice())
        .map_err(|e| CertificateError::Generate(format!("malformed PKCS#8 key: {}", e)))?;

    let block = pem::Pem::new("RSA PRIVATE KEY", info.private_key.to_vec());
    Ok(pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}

fn create_cert_dir(dir: &Path) -> Result<(), CertificateError> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)?;
    }

    #[cfg(not(unix))]
    fs::create_dir_all(dir)?;

    Ok(())
}

fn write_private_key(path: &Path, pem: &[u8]) -> Result<(), CertificateError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(pem)?;

    // mode() only applies on creation; tighten an existing file as well.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
