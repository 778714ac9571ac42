//! Certificate authority for cluster control planes
//!
//! The orchestrator holds one CA and issues each cluster's API server
//! certificate when the control plane is bootstrapped. The certificate
//! names every control-node hostname and address, current and planned, so
//! control nodes joining later present a certificate that already covers
//! them.

use std::net::IpAddr;

use chrono::{Datelike, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use zeroize::Zeroizing;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// A subject alternative name is not a valid DNS name
    #[error("invalid subject alternative name: {0}")]
    InvalidName(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

impl From<PkiError> for crate::Error {
    fn from(err: PkiError) -> Self {
        crate::Error::bootstrap("pki", err.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Organization written into every subject
const ORGANIZATION: &str = "cluster-orchestrator";

/// Certificate, key and CA chain handed to a control node
#[derive(Clone)]
pub struct TlsBundle {
    /// Leaf certificate (PEM)
    pub cert_pem: String,
    /// Leaf private key (PEM)
    pub key_pem: Zeroizing<String>,
    /// Issuing CA certificate (PEM)
    pub ca_cert_pem: String,
}

impl std::fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBundle")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Names to cover in an API server certificate
#[derive(Clone, Debug, Default)]
pub struct ControlPlaneCertRequest {
    /// Cluster name, used as the subject
    pub cluster_name: String,
    /// Every control-node hostname, current and planned
    pub hostnames: Vec<String>,
    /// Public and private addresses the API is served on
    pub addresses: Vec<IpAddr>,
    /// DNS domain of the cluster
    pub cluster_domain: String,
    /// Additional names or addresses
    pub extra_sans: Vec<String>,
}

impl ControlPlaneCertRequest {
    /// Every subject alternative name, deduplicated in first-seen order
    pub fn subject_alt_names(&self) -> Result<Vec<SanType>> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        };
        for host in &self.hostnames {
            push(host.clone());
        }
        for service in [
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            format!("kubernetes.default.svc.{}", self.cluster_domain),
            "localhost".to_string(),
        ] {
            push(service);
        }
        for address in &self.addresses {
            push(address.to_string());
        }
        push("127.0.0.1".to_string());
        for extra in &self.extra_sans {
            push(extra.clone());
        }

        names
            .into_iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| PkiError::InvalidName(format!("{name}: {e}"))),
            })
            .collect()
    }
}

/// Certificate Authority issuing control-plane certificates
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_key_pem", &"<redacted>")
            .finish()
    }
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Validity window starting today and lasting `years`
fn validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    let (month, day) = (today.month() as u8, (today.day() as u8).min(28));
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        validity(&mut params, 10);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = Zeroizing::new(key_pair.serialize_pem());

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM, checking both halves parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue an API server certificate and key for a cluster
    ///
    /// The key is generated here and only ever leaves in the bundle.
    pub fn issue_control_plane_bundle(&self, request: &ControlPlaneCertRequest) -> Result<TlsBundle> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(&format!("{}-apiserver", request.cluster_name));
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = request.subject_alt_names()?;
        validity(&mut params, 1);

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(TlsBundle {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
            ca_cert_pem: self.ca_cert_pem.clone(),
        })
    }
}
