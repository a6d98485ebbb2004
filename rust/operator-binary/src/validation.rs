//! Static validation of Certificates and Issuers, shared by the admission webhook and the
//! certificate controller.

use std::{fmt::Display, net::IpAddr, time::Duration};

use crate::crd::{
    CertificateSpec, GenericIssuer, IssuerConfig, KeyAlgorithm, CLUSTER_ISSUER_KIND, ISSUER_KIND,
};

pub const MIN_CERT_DURATION: Duration = Duration::from_secs(60 * 60);
pub const MIN_RENEW_BEFORE: Duration = Duration::from_secs(5 * 60);
pub const MAX_COMMON_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid(String),
    Forbidden(String),
}

/// A validation failure of a single field, identified by its path (`spec.secretName`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
}

impl FieldError {
    pub fn required(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: FieldErrorKind::Required,
        }
    }

    pub fn invalid(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: FieldErrorKind::Invalid(detail.into()),
        }
    }

    pub fn forbidden(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: FieldErrorKind::Forbidden(detail.into()),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FieldErrorKind::Required => write!(f, "{}: Required value", self.field),
            FieldErrorKind::Invalid(detail) => write!(f, "{}: Invalid value: {detail}", self.field),
            FieldErrorKind::Forbidden(detail) => write!(f, "{}: Forbidden: {detail}", self.field),
        }
    }
}

/// Joins `errors` into a single message, or `None` if there are no errors.
pub fn aggregate(errors: &[FieldError]) -> Option<String> {
    match errors {
        [] => None,
        [single] => Some(single.to_string()),
        _ => Some(format!(
            "[{}]",
            errors
                .iter()
                .map(FieldError::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

pub fn validate_certificate(spec: &CertificateSpec) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if spec.secret_name.is_empty() {
        errors.push(FieldError::required("spec.secretName"));
    }

    if spec.issuer_ref.name.is_empty() {
        errors.push(FieldError::required("spec.issuerRef.name"));
    }
    match spec.issuer_ref.kind.as_deref() {
        None | Some("") | Some(ISSUER_KIND) | Some(CLUSTER_ISSUER_KIND) => {}
        Some(kind) => errors.push(FieldError::invalid(
            "spec.issuerRef.kind",
            format!("{kind:?}: must be one of {ISSUER_KIND:?} or {CLUSTER_ISSUER_KIND:?}"),
        )),
    }

    let common_name = spec.common_name.as_deref().unwrap_or_default();
    if common_name.is_empty() && spec.dns_names.is_empty() {
        errors.push(FieldError::invalid(
            "spec",
            "at least one of commonName or dnsNames must be set",
        ));
    }
    if common_name.chars().count() > MAX_COMMON_NAME_LENGTH {
        errors.push(FieldError::invalid(
            "spec.commonName",
            format!("must be no more than {MAX_COMMON_NAME_LENGTH} characters"),
        ));
    }

    for (i, address) in spec.ip_addresses.iter().enumerate() {
        if address.parse::<IpAddr>().is_err() {
            errors.push(FieldError::invalid(
                format!("spec.ipAddresses[{i}]"),
                format!("{address:?}: not a valid IP address"),
            ));
        }
    }

    if let Some(key_size) = spec.key_size {
        let algorithm = spec.key_algorithm.unwrap_or_default();
        let valid = match algorithm {
            KeyAlgorithm::Rsa => key_size == 0 || (2048..=8192).contains(&key_size),
            KeyAlgorithm::Ecdsa => matches!(key_size, 0 | 256 | 384 | 521),
        };
        if !valid {
            let allowed = match algorithm {
                KeyAlgorithm::Rsa => "must be between 2048 and 8192 for rsa keys",
                KeyAlgorithm::Ecdsa => "must be one of 256, 384 or 521 for ecdsa keys",
            };
            errors.push(FieldError::invalid(
                "spec.keySize",
                format!("{key_size}: {allowed}"),
            ));
        }
    }

    if let Some(duration) = spec.duration {
        if *duration < MIN_CERT_DURATION {
            errors.push(FieldError::invalid(
                "spec.duration",
                format!("certificate duration must be at least {MIN_CERT_DURATION:?}"),
            ));
        }
    }
    if let Some(renew_before) = spec.renew_before {
        if *renew_before < MIN_RENEW_BEFORE {
            errors.push(FieldError::invalid(
                "spec.renewBefore",
                format!("renewBefore must be at least {MIN_RENEW_BEFORE:?}"),
            ));
        }
        if let Some(duration) = spec.duration {
            if *renew_before >= *duration {
                errors.push(FieldError::invalid(
                    "spec.renewBefore",
                    "renewBefore must be shorter than duration",
                ));
            }
        }
    }

    if let Some(acme) = &spec.acme {
        for (i, solver) in acme.config.iter().enumerate() {
            let path = format!("spec.acme.config[{i}]");
            if solver.domains.is_empty() {
                errors.push(FieldError::required(format!("{path}.domains")));
            }
            match (&solver.http01, &solver.dns01) {
                (Some(_), None) => {}
                (None, Some(dns01)) => {
                    if dns01.provider.is_empty() {
                        errors.push(FieldError::required(format!("{path}.dns01.provider")));
                    }
                }
                _ => errors.push(FieldError::invalid(
                    path,
                    "exactly one of http01 or dns01 must be set",
                )),
            }
        }
    }

    errors
}

/// Checks the fields of `spec` that depend on the kind of backend `issuer` uses.
pub fn validate_certificate_for_issuer(
    spec: &CertificateSpec,
    issuer: &GenericIssuer,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if issuer.config().acme.is_some() {
        if spec.is_ca {
            errors.push(FieldError::forbidden(
                "spec.isCA",
                "ACME does not support CA certificates",
            ));
        }
        if !spec.organization.is_empty() {
            errors.push(FieldError::forbidden(
                "spec.organization",
                "ACME does not support setting the organization name",
            ));
        }
        if spec.duration.is_some() {
            errors.push(FieldError::forbidden(
                "spec.duration",
                "ACME does not support certificate durations",
            ));
        }
        if spec.acme.is_none() {
            errors.push(FieldError::required("spec.acme"));
        }
    }
    errors
}

pub fn validate_issuer_config(config: &IssuerConfig) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match config.configured_backend_count() {
        0 => errors.push(FieldError::invalid(
            "spec",
            "at least one issuer backend must be configured",
        )),
        1 => {}
        _ => errors.push(FieldError::forbidden(
            "spec",
            "only one issuer backend may be configured",
        )),
    }
    if let Some(ca) = &config.ca {
        if ca.secret_name.is_empty() {
            errors.push(FieldError::required("spec.ca.secretName"));
        }
    }
    if let Some(acme) = &config.acme {
        if acme.server.is_empty() {
            errors.push(FieldError::required("spec.acme.server"));
        }
        if acme.email.is_empty() {
            errors.push(FieldError::required("spec.acme.email"));
        }
        if acme.private_key_secret_ref.name.is_empty() {
            errors.push(FieldError::required("spec.acme.privateKeySecretRef.name"));
        }
    }
    errors
}
