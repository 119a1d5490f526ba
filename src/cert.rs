use anyhow::{Context, Error, bail};
use itertools::Itertools;
use pem::{EncodeConfig, LineEnding};
use rcgen::{CertificateParams, CertificateSigningRequest, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Cursor, Seek};
use time::OffsetDateTime;
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// The maximum number of certificates we will parse in a PEM-array of certificates by default
const DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH: usize = 100;

const PKCS9_EMAIL_ADDRESS: &[u64] = &[1, 2, 840, 113_549, 1, 9, 1];

/// Subject fields for a certificate request. Only `common_name` is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrOptions {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

impl CsrOptions {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Every name the certificate covers: the common name first, then the alt names, each once.
    pub fn domains(&self) -> Vec<String> {
        std::iter::once(&self.common_name)
            .chain(&self.alt_names)
            .unique()
            .cloned()
            .collect()
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        let optional_fields = [
            (DnType::CountryName, &self.country),
            (DnType::StateOrProvinceName, &self.state),
            (DnType::LocalityName, &self.locality),
            (DnType::OrganizationName, &self.organization),
            (DnType::OrganizationalUnitName, &self.organization_unit),
            (
                DnType::CustomDnType(PKCS9_EMAIL_ADDRESS.to_vec()),
                &self.email_address,
            ),
        ];
        for (dn_type, value) in optional_fields {
            if let Some(value) = value {
                dn.push(dn_type, value.as_str());
            }
        }
        dn
    }
}

/// A signed certificate request together with the PEM encoded private key it was signed with.
pub struct SigningRequest {
    pub private_key_pem: String,
    csr: CertificateSigningRequest,
}

impl SigningRequest {
    pub fn der(&self) -> &[u8] {
        self.csr.der().as_ref()
    }
}

pub fn create_csr(options: &CsrOptions) -> Result<SigningRequest, Error> {
    if options.common_name.is_empty() {
        bail!("A certificate request needs a common name");
    }
    let key = KeyPair::generate().context("Generating certificate key failed")?;
    let mut cert_params =
        CertificateParams::new(options.domains()).context("CSR generation failed")?;
    cert_params.distinguished_name = options.distinguished_name();
    let csr = cert_params
        .serialize_request(&key)
        .context("Signing CSR failed")?;
    Ok(SigningRequest {
        private_key_pem: key.serialize_pem(),
        csr,
    })
}

pub fn load_certificates_from_memory<B: AsRef<[u8]>>(
    pem_bytes: B,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    load_certificates_from_reader(reader, limit)
}

fn load_certificates_from_reader<R: BufRead + Seek>(
    reader: R,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let mut certificates = Vec::new();
    for pem in
        Pem::iter_from_reader(reader).take(limit.unwrap_or(DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH))
    {
        let pem = pem.context("Reading PEM block failed")?;
        let parsed_x509 = ParsedX509Certificate::try_from(pem.contents)?;
        certificates.push(parsed_x509);
    }
    Ok(certificates)
}

/// Parse the first (leaf) certificate of a PEM bundle.
pub fn load_leaf_certificate<B: AsRef<[u8]>>(pem_bytes: B) -> anyhow::Result<ParsedX509Certificate> {
    load_certificates_from_memory(pem_bytes, Some(1))?
        .into_iter()
        .next()
        .context("No certificate found in PEM data")
}

/// Extract the last certificate of a full chain, i.e. the issuer certificate closest to the root.
pub fn ca_certificate_from_chain(full_chain: &str) -> anyhow::Result<String> {
    let blocks = pem::parse_many(full_chain).context("Parsing certificate chain failed")?;
    let ca = blocks
        .iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .next_back()
        .context("Certificate chain does not contain any certificate")?;
    Ok(pem::encode_config(
        ca,
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub validity: Validity,
    pub dns_names: Vec<String>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let mut dns_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => dns_names.push((*dns_name).to_string()),
                        unsupported => {
                            warn!("Ignoring general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            serial: cert.serial.clone(),
            subject: cert.subject.to_string(),
            issuer: cert.issuer.to_string(),
            validity: (&cert.validity).into(),
            dns_names,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    pub fn time_to_expiration(&self, now: OffsetDateTime) -> time::Duration {
        self.not_after - now
    }

    /// Whole days left until `not_after`, counting a started day as a full one. Expired
    /// certificates have zero days left.
    pub fn days_till_expiry(&self, now: OffsetDateTime) -> i64 {
        let remaining = self.time_to_expiration(now);
        if !remaining.is_positive() {
            return 0;
        }
        let whole_days = remaining.whole_days();
        if remaining > time::Duration::days(whole_days) {
            whole_days + 1
        } else {
            whole_days
        }
    }
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
