//! X.509 helpers: comparing live key material against a [`CertificateSpec`], and generating
//! keys and certificates for it.

use std::{collections::BTreeSet, net::IpAddr};

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName,
            SubjectKeyIdentifier,
        },
        GeneralNameRef, X509Builder, X509Name, X509NameBuilder, X509Ref, X509,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use crate::crd::{CertificateSpec, KeyAlgorithm, KeyEncoding};

/// Validity of issued certificates that do not request a `duration`.
pub const DEFAULT_CERT_DURATION: Duration = Duration::from_days_unchecked(365);

pub const DEFAULT_RSA_KEY_SIZE: u32 = 2048;
pub const DEFAULT_ECDSA_KEY_SIZE: u32 = 256;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no domains specified on certificate"))]
    NoDomains,

    #[snafu(display("invalid IP address {address:?}"))]
    InvalidIpAddress {
        source: std::net::AddrParseError,
        address: String,
    },

    #[snafu(display("unsupported {algorithm:?} key size {key_size}"))]
    UnsupportedKeySize {
        algorithm: KeyAlgorithm,
        key_size: u32,
    },

    #[snafu(display("failed to generate private key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to encode private key"))]
    EncodeKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to decode private key"))]
    DecodeKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to decode certificate"))]
    DecodeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("PEM data contains no certificate"))]
    NoCertificate,

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("certificate validity ends before it starts"))]
    InvalidValidity,
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The common name requested by `spec`: `commonName`, else the first DNS name, else empty.
pub fn common_name_for_certificate(spec: &CertificateSpec) -> String {
    match &spec.common_name {
        Some(cn) if !cn.is_empty() => cn.clone(),
        _ => spec.dns_names.first().cloned().unwrap_or_default(),
    }
}

/// The DNS SANs requested by `spec`, with the `commonName` (if any) first.
pub fn dns_names_for_certificate(spec: &CertificateSpec) -> Vec<String> {
    let common_name = spec.common_name.as_deref().filter(|cn| !cn.is_empty());
    let mut names = Vec::with_capacity(spec.dns_names.len() + 1);
    for name in common_name.into_iter().chain(spec.dns_names.iter().map(String::as_str)) {
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// The IP SANs requested by `spec`.
pub fn ip_addresses_for_certificate(spec: &CertificateSpec) -> Result<Vec<IpAddr>> {
    spec.ip_addresses
        .iter()
        .map(|address| {
            address
                .parse::<IpAddr>()
                .context(InvalidIpAddressSnafu { address })
        })
        .collect()
}

/// Canonical string form of an IP address literal, unparsable input is kept verbatim.
fn canonical_ip(address: &str) -> String {
    address
        .parse::<IpAddr>()
        .map_or_else(|_| address.to_string(), |ip| ip.to_string())
}

pub fn certificate_common_name(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_default()
}

pub fn certificate_dns_names(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|sans| {
            sans.iter()
                .filter_map(GeneralNameRef::dnsname)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn certificate_ip_addresses(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|sans| {
            sans.iter()
                .filter_map(GeneralNameRef::ipaddress)
                .filter_map(|raw| match raw.len() {
                    4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
                    16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
                    _ => None,
                })
                .map(|ip| ip.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Checks whether the live `key` and `cert` satisfy `spec`.
///
/// Returns the human-readable reasons for every mismatch. Expiry is not considered.
pub fn matches(
    spec: &CertificateSpec,
    key: &PKeyRef<Private>,
    cert: &X509Ref,
) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    match cert.public_key() {
        Ok(public_key) if public_key.public_eq(key) => {}
        Ok(_) => reasons.push("Certificate private key does not match certificate".to_string()),
        Err(err) => reasons.push(format!("Failed to read certificate public key: {err}")),
    }

    let live_cn = certificate_common_name(cert);
    if common_name_for_certificate(spec) != live_cn {
        reasons.push(format!(
            "Common name on TLS certificate not up to date: {live_cn:?}"
        ));
    }

    let live_dns_names = certificate_dns_names(cert);
    if !equal_unsorted(&live_dns_names, &dns_names_for_certificate(spec)) {
        reasons.push(format!(
            "DNS names on TLS certificate not up to date: {live_dns_names:?}"
        ));
    }

    let live_ips = certificate_ip_addresses(cert);
    let desired_ips = spec
        .ip_addresses
        .iter()
        .map(|ip| canonical_ip(ip))
        .collect::<Vec<_>>();
    if !equal_unsorted(&live_ips, &desired_ips) {
        reasons.push(format!(
            "IP addresses on TLS certificate not up to date: {live_ips:?}"
        ));
    }

    (reasons.is_empty(), reasons)
}

/// Compares two lists as sets, ignoring order and duplicates.
fn equal_unsorted(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Generates a fresh private key according to `keyAlgorithm` and `keySize`.
pub fn generate_private_key(spec: &CertificateSpec) -> Result<PKey<Private>> {
    let algorithm = spec.key_algorithm.unwrap_or_default();
    match algorithm {
        KeyAlgorithm::Rsa => {
            let key_size = match spec.key_size {
                None | Some(0) => DEFAULT_RSA_KEY_SIZE,
                Some(size) => size,
            };
            Rsa::generate(key_size)
                .and_then(PKey::try_from)
                .context(GenerateKeySnafu)
        }
        KeyAlgorithm::Ecdsa => {
            let key_size = match spec.key_size {
                None | Some(0) => DEFAULT_ECDSA_KEY_SIZE,
                Some(size) => size,
            };
            let curve = match key_size {
                256 => Nid::X9_62_PRIME256V1,
                384 => Nid::SECP384R1,
                521 => Nid::SECP521R1,
                _ => {
                    return UnsupportedKeySizeSnafu {
                        algorithm,
                        key_size,
                    }
                    .fail()
                }
            };
            EcGroup::from_curve_name(curve)
                .and_then(|group| EcKey::generate(&group))
                .and_then(PKey::from_ec_key)
                .context(GenerateKeySnafu)
        }
    }
}

/// Encodes `key` as PEM, either as PKCS#8 or in the algorithm's traditional format
/// (PKCS#1 for RSA, SEC1 for ECDSA).
pub fn encode_private_key(key: &PKeyRef<Private>, encoding: KeyEncoding) -> Result<Vec<u8>> {
    match encoding {
        KeyEncoding::Pkcs1 => key.private_key_to_pem_traditional(),
        KeyEncoding::Pkcs8 => key.private_key_to_pem_pkcs8(),
    }
    .context(EncodeKeySnafu)
}

/// Decodes a PEM private key in PKCS#1, SEC1 or PKCS#8 format.
pub fn decode_private_key(pem: &[u8]) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(pem).context(DecodeKeySnafu)
}

/// Decodes the leaf (first) certificate of a PEM chain.
pub fn decode_first_certificate(pem: &[u8]) -> Result<X509> {
    X509::stack_from_pem(pem)
        .context(DecodeCertificateSnafu)?
        .into_iter()
        .next()
        .context(NoCertificateSnafu)
}

fn subject_name(
    common_name: &str,
    organization: &[String],
) -> Result<X509Name, openssl::error::ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    for org in organization {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
    }
    if !common_name.is_empty() {
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    }
    Ok(name.build())
}

/// The CA that signs a certificate.
pub struct SigningCa<'a> {
    pub certificate: &'a X509Ref,
    pub key: &'a PKeyRef<Private>,
}

/// Everything that goes into an issued certificate, derived from a [`CertificateSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateTemplate {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub organization: Vec<String>,
    pub is_ca: bool,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl CertificateTemplate {
    pub fn from_spec(spec: &CertificateSpec, now: OffsetDateTime) -> Result<Self> {
        let common_name = common_name_for_certificate(spec);
        let dns_names = dns_names_for_certificate(spec);
        if common_name.is_empty() && dns_names.is_empty() {
            return NoDomainsSnafu.fail();
        }
        let duration = spec.duration.unwrap_or(DEFAULT_CERT_DURATION);
        Ok(Self {
            common_name,
            dns_names,
            ip_addresses: ip_addresses_for_certificate(spec)?,
            organization: spec.organization.clone(),
            is_ca: spec.is_ca,
            not_before: now,
            not_after: now + duration,
        })
    }

    fn subject_alt_name(&self) -> Option<SubjectAlternativeName> {
        if self.dns_names.is_empty() && self.ip_addresses.is_empty() {
            return None;
        }
        let mut san = SubjectAlternativeName::new();
        for dns in &self.dns_names {
            san.dns(dns);
        }
        for ip in &self.ip_addresses {
            san.ip(&ip.to_string());
        }
        Some(san)
    }

    /// Signs a certificate for `subject_key`, with `ca` or self-signed if `ca` is `None`.
    pub fn sign(&self, subject_key: &PKeyRef<Private>, ca: Option<SigningCa>) -> Result<X509> {
        if self.not_after <= self.not_before {
            return InvalidValiditySnafu.fail();
        }
        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        X509Builder::new()
            .and_then(|mut x509| {
                let subject_name = subject_name(&self.common_name, &self.organization)?;
                x509.set_subject_name(&subject_name)?;
                match &ca {
                    Some(ca) => x509.set_issuer_name(ca.certificate.subject_name())?,
                    None => x509.set_issuer_name(&subject_name)?,
                }
                x509.set_not_before(
                    Asn1Time::from_unix(self.not_before.unix_timestamp())?.as_ref(),
                )?;
                x509.set_not_after(Asn1Time::from_unix(self.not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(subject_key)?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let mut serial = BigNum::new()?;
                serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
                x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;

                let mut key_usage = KeyUsage::new();
                key_usage.critical().digital_signature().key_encipherment();
                let mut basic_constraints = BasicConstraints::new();
                basic_constraints.critical();
                if self.is_ca {
                    key_usage.key_cert_sign().crl_sign();
                    basic_constraints.ca();
                }
                let mut exts = vec![basic_constraints.build()?, key_usage.build()?];
                {
                    let ctx = x509.x509v3_context(ca.as_ref().map(|ca| ca.certificate), Some(&conf));
                    exts.push(SubjectKeyIdentifier::new().build(&ctx)?);
                    if ca.is_some() {
                        exts.push(
                            AuthorityKeyIdentifier::new()
                                .issuer(true)
                                .keyid(true)
                                .build(&ctx)?,
                        );
                    }
                    if let Some(san) = self.subject_alt_name() {
                        exts.push(san.build(&ctx)?);
                    }
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                Ok(x509)
            })
            .and_then(|mut x509| {
                let signing_key = ca.as_ref().map_or(subject_key, |ca| ca.key);
                x509.sign(signing_key, MessageDigest::sha256())?;
                Ok(x509.build())
            })
            .context(BuildCertificateSnafu)
    }
}
