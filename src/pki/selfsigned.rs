//! Self-signed CA and leaf issuance.
//!
//! The signer holds one key pair. For a webhook the flow is: a root signer
//! generates a self-signed CA, a second signer generates the serving CSR,
//! and the root signs it for the configured validity. The serving key never
//! leaves its signer.

use std::time::Duration;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;

use super::CertBundle;
use crate::{Error, Result};

/// Validity of a generated CA certificate: ten years
const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Subject options for a certificate or CSR
#[derive(Debug, Clone, Default)]
pub struct CertOptions {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl CertOptions {
    /// Options with the given common name and no SANs
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            dns_names: Vec::new(),
        }
    }

    /// Add DNS subject alternative names
    pub fn with_dns_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Holder of one key pair that can produce CSRs, self-signed CA
/// certificates, and signatures over foreign CSRs.
pub struct SelfSigner {
    // KeyPair is not Clone; the PEM form is the canonical copy.
    key_pem: String,
    ca_cert_pem: Option<String>,
}

impl SelfSigner {
    /// Generate a fresh key pair
    pub fn new() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|err| Error::pki(format!("key generation failed: {err}")))?;
        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            ca_cert_pem: None,
        })
    }

    /// The private key in PEM form
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Generate a certificate signing request for this signer's key
    pub fn gen_csr(&self, opts: &CertOptions) -> Result<String> {
        let params = base_params(opts)?;
        let csr = params
            .serialize_request(&self.key_pair()?)
            .map_err(|err| Error::pki(format!("failed to create CSR: {err}")))?;
        csr.pem()
            .map_err(|err| Error::pki(format!("failed to serialize CSR: {err}")))
    }

    /// Generate a self-signed CA certificate for this signer's key.
    ///
    /// The certificate is retained; `sign` uses it as the issuer.
    pub fn gen_cert(&mut self, opts: &CertOptions) -> Result<String> {
        let mut params = base_params(opts)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CA_VALIDITY;

        let cert = params
            .self_signed(&self.key_pair()?)
            .map_err(|err| Error::pki(format!("failed to create CA certificate: {err}")))?;
        let pem = cert.pem();
        self.ca_cert_pem = Some(pem.clone());
        Ok(pem)
    }

    /// Sign a PEM CSR against the previously generated CA certificate.
    ///
    /// The subject and SANs are taken from the CSR; usages are fixed to a
    /// TLS serving profile and the validity to `validity` from now.
    pub fn sign(&self, csr_pem: &str, validity: Duration) -> Result<String> {
        let ca_pem = self
            .ca_cert_pem
            .as_deref()
            .ok_or_else(|| Error::pki("signer has no certificate, call gen_cert first"))?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|err| Error::pki(format!("failed to parse CSR: {err}")))?;
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now
            + time::Duration::try_from(validity)
                .map_err(|err| Error::pki(format!("invalid validity: {err}")))?;

        let ca_key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(ca_pem, &ca_key)
            .map_err(|err| Error::pki(format!("failed to load issuer: {err}")))?;
        let cert = csr
            .signed_by(&issuer)
            .map_err(|err| Error::pki(format!("failed to sign certificate: {err}")))?;
        Ok(cert.pem())
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|err| Error::pki(format!("failed to load key pair: {err}")))
    }
}

fn base_params(opts: &CertOptions) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(opts.common_name.clone()),
    );
    params.distinguished_name = dn;
    params.subject_alt_names = opts
        .dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.as_str())
                .map(SanType::DnsName)
                .map_err(|err| Error::pki(format!("invalid DNS name {name}: {err}")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(params)
}

/// Self-signed issuance: a fresh root CA plus a serving certificate signed
/// by it for `validity`. Returns {CA bundle, serving cert, serving key}.
pub fn issue_self_signed(
    root_opts: &CertOptions,
    svc_opts: &CertOptions,
    validity: Duration,
) -> Result<CertBundle> {
    let mut root = SelfSigner::new()?;
    let ca_pem = root.gen_cert(root_opts)?;

    let svc = SelfSigner::new()?;
    let csr_pem = svc.gen_csr(svc_opts)?;
    let leaf_pem = root.sign(&csr_pem, validity)?;

    Ok(CertBundle {
        ca_bundle: ca_pem.into_bytes(),
        tls_cert: leaf_pem.into_bytes(),
        tls_key: svc.private_key_pem().as_bytes().to_vec(),
    })
}
