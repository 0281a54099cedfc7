use crate::config::CertificateConfig;
use crate::error::ProxyError;
use crate::Result;
use dashmap::DashMap;
use hudsucker::{
    certificate_authority::CertificateAuthority as TlsAuthority,
    hyper::http::uri::Authority,
    rustls::{
        self,
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
        ServerConfig,
    },
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "devproxy Local CA";
const CA_ORGANIZATION: &str = "devproxy";

/// Root CA certificate and private key, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Owns the root CA files on disk.
///
/// The manager is the only writer of `ca.pem`/`ca.key`; material already on disk
/// is returned untouched so the CA survives restarts byte-for-byte.
#[derive(Debug, Clone)]
pub struct CertificateAuthorityManager {
    storage_path: PathBuf,
    validity_days: u32,
}

impl CertificateAuthorityManager {
    pub fn new(config: &CertificateConfig) -> Self {
        Self {
            storage_path: config.storage_path.clone(),
            validity_days: config.ca_validity_days,
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn cert_path(&self) -> PathBuf {
        self.storage_path.join(CA_CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.storage_path.join(CA_KEY_FILE)
    }

    /// Load the cached CA, or generate and persist a fresh one.
    pub fn ensure(&self) -> Result<CaMaterial> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        if cert_path.exists() && key_path.exists() {
            let material = CaMaterial {
                cert_pem: fs::read_to_string(&cert_path)?,
                key_pem: fs::read_to_string(&key_path)?,
            };
            // Reject unusable files instead of silently replacing them
            KeyPair::from_pem(&material.key_pem)
                .map_err(|e| ProxyError::Tls(format!("Failed to parse CA key: {}", e)))?;
            debug!("Loaded CA from {}", self.storage_path.display());
            return Ok(material);
        }

        fs::create_dir_all(&self.storage_path)?;
        let material = generate_ca(self.validity_days)?;

        fs::write(&cert_path, &material.cert_pem)?;
        write_private(&key_path, &material.key_pem)?;
        // Same certificate with the extension trust-store installers expect
        fs::write(cert_path.with_extension("crt"), &material.cert_pem)?;

        info!("Generated new CA at {}", self.storage_path.display());
        Ok(material)
    }
}

/// Load or create the CA material stored under `storage_path` with default validity.
pub fn ensure_certificate_authority(storage_path: &Path) -> Result<CaMaterial> {
    let config = CertificateConfig {
        storage_path: storage_path.to_path_buf(),
        ..Default::default()
    };
    CertificateAuthorityManager::new(&config).ensure()
}

fn generate_ca(validity_days: u32) -> Result<CaMaterial> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(i64::from(validity_days));

    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::Tls(format!("Failed to generate CA key: {}", e)))?;
    params.key_pair = Some(key_pair);

    let cert = Certificate::from_params(params)
        .map_err(|e| ProxyError::Tls(format!("Failed to generate CA cert: {}", e)))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| ProxyError::Tls(format!("Failed to serialize CA cert: {}", e)))?;

    Ok(CaMaterial {
        cert_pem,
        key_pem: cert.serialize_private_key_pem(),
    })
}

fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())
}

/// A minted per-host certificate and its private key (DER).
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub cert_pem: String,
}

/// Source of leaf certificates trusted through the root CA.
pub trait CertificateProvider: Send + Sync + 'static {
    fn leaf_for_host(&self, host: &str) -> Result<LeafCertificate>;
}

/// Signs leaf certificates with the root CA.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    leaf_validity_days: u32,
}

impl CertificateAuthority {
    /// Rebuild a signing authority from PEM material, keeping the stored subject.
    pub fn from_material(material: &CaMaterial, leaf_validity_days: u32) -> Result<Self> {
        let key_pair = KeyPair::from_pem(&material.key_pem)
            .map_err(|e| ProxyError::Tls(format!("Failed to parse CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(&material.cert_pem, key_pair)
            .map_err(|e| ProxyError::Tls(format!("Failed to parse CA cert: {}", e)))?;
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Tls(format!("Failed to load CA cert: {}", e)))?;

        Ok(Self {
            ca_cert,
            leaf_validity_days,
        })
    }
}

impl CertificateProvider for CertificateAuthority {
    fn leaf_for_host(&self, host: &str) -> Result<LeafCertificate> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(self.leaf_validity_days));

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Tls(format!("Failed to build cert for {}: {}", host, e)))?;
        let cert_der = cert
            .serialize_der_with_signer(&self.ca_cert)
            .map_err(|e| ProxyError::Tls(format!("Failed to sign cert for {}: {}", host, e)))?;

        Ok(LeafCertificate {
            cert_pem: der_to_pem(&cert_der),
            cert_der,
            key_der: cert.serialize_private_key_der(),
        })
    }
}

fn der_to_pem(der: &[u8]) -> String {
    use base64::Engine;

    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Adapter giving hudsucker per-host rustls configurations from a [`CertificateProvider`].
pub struct InterceptAuthority {
    provider: Arc<dyn CertificateProvider>,
    cache: DashMap<String, Arc<ServerConfig>>,
    cache_size: usize,
}

impl InterceptAuthority {
    pub fn new(provider: Arc<dyn CertificateProvider>, cache_size: usize) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            cache_size: cache_size.max(1),
        }
    }

    fn build_config(&self, host: &str) -> Result<ServerConfig> {
        let leaf = self.provider.leaf_for_host(host)?;
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(leaf.cert_der)],
                rustls::PrivateKey(leaf.key_der),
            )
            .map_err(|e| ProxyError::Tls(format!("Invalid leaf for {}: {}", host, e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

#[async_trait::async_trait]
impl TlsAuthority for InterceptAuthority {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        if let Some(config) = self.cache.get(&host) {
            return config.clone();
        }

        match self.build_config(&host) {
            Ok(config) => {
                let config = Arc::new(config);
                if self.cache.len() >= self.cache_size {
                    self.cache.clear();
                }
                self.cache.insert(host, config.clone());
                config
            }
            Err(e) => {
                // The handshake fails with an alert instead of bringing the proxy down
                error!("{}", e);
                Arc::new(
                    ServerConfig::builder()
                        .with_safe_defaults()
                        .with_no_client_auth()
                        .with_cert_resolver(Arc::new(NoCertificate)),
                )
            }
        }
    }
}

#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}
