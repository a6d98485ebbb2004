//! In-memory stand-ins for the Kubernetes API and issuer backends.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{ObjectReference, Secret},
        ByteString,
    },
    kube::{self, api::ObjectMeta, ResourceExt},
};
use time::OffsetDateTime;

use crate::{
    admission::{AccessReviewer, AuthorizationError},
    client::CertificateClient,
    crd::{Certificate, CertificateSpec, ClusterIssuer, GenericIssuer, Issuer},
    events::{EventRecorder, EventType},
    issuer::{self, Dynamic, FromIssuerError, IssuerBackend, IssuerBackendError, IssuerFactory},
    pki::{self, CertificateTemplate},
    secret::{KeyPairPem, SecretStore, TLS_CA_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY},
    utils::{Clock, Unloggable},
};

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake API error: {reason}"),
        reason: reason.to_string(),
        code,
    })
}

/// Issues a self-signed key pair for `spec`, valid from `not_before` until `not_after`.
pub fn self_signed_pem_valid(
    spec: &CertificateSpec,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> KeyPairPem {
    let key = pki::generate_private_key(spec).unwrap();
    let mut template = CertificateTemplate::from_spec(spec, not_before).unwrap();
    template.not_after = not_after;
    let cert = template.sign(&key, None).unwrap().to_pem().unwrap();
    KeyPairPem {
        certificate: cert.clone(),
        private_key: Unloggable(
            pki::encode_private_key(&key, spec.key_encoding.unwrap_or_default()).unwrap(),
        ),
        ca: cert,
    }
}

/// Issues a self-signed key pair for `spec`, valid from now for the requested duration.
pub fn self_signed_pem(spec: &CertificateSpec) -> KeyPairPem {
    let now = OffsetDateTime::now_utc();
    let duration = spec.duration.unwrap_or(pki::DEFAULT_CERT_DURATION);
    self_signed_pem_valid(spec, now, now + duration)
}

pub fn tls_secret(namespace: &str, name: &str, pem: &KeyPairPem) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some(crate::secret::SECRET_TYPE_TLS.to_string()),
        data: Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(pem.certificate.clone())),
            (
                TLS_PRIVATE_KEY_KEY.to_string(),
                ByteString(pem.private_key.to_vec()),
            ),
            (TLS_CA_KEY.to_string(), ByteString(pem.ca.clone())),
        ])),
        ..Secret::default()
    }
}

fn object_key<K: ResourceExt>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

#[derive(Default)]
pub struct FakeSecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    writes: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FakeSecretStore {
    pub fn insert(&self, secret: Secret) {
        self.secrets
            .lock()
            .unwrap()
            .insert(object_key(&secret), secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of successful creates and updates.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self, secret: &Secret, must_exist: bool) -> Result<Secret, kube::Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError"));
        }
        let mut secrets = self.secrets.lock().unwrap();
        let key = object_key(secret);
        match (secrets.contains_key(&key), must_exist) {
            (true, false) => return Err(api_error(409, "AlreadyExists")),
            (false, true) => return Err(api_error(404, "NotFound")),
            _ => {}
        }
        secrets.insert(key, secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(secret.clone())
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError"));
        }
        Ok(self.secret(namespace, name))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        self.write(secret, false)
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        self.write(secret, true)
    }
}

#[derive(Default)]
pub struct FakeCertificateClient {
    certificates: Mutex<BTreeMap<(String, String), Certificate>>,
    issuers: Mutex<BTreeMap<(String, String), Issuer>>,
    cluster_issuers: Mutex<BTreeMap<String, ClusterIssuer>>,
    certificate_status_writes: AtomicUsize,
    issuer_status_writes: AtomicUsize,
    pub fail_status_writes: AtomicBool,
}

impl FakeCertificateClient {
    pub fn add_certificate(&self, certificate: Certificate) {
        self.certificates
            .lock()
            .unwrap()
            .insert(object_key(&certificate), certificate);
    }

    pub fn certificate(&self, namespace: &str, name: &str) -> Option<Certificate> {
        self.certificates
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn add_issuer(&self, issuer: Issuer) {
        self.issuers
            .lock()
            .unwrap()
            .insert(object_key(&issuer), issuer);
    }

    pub fn issuer(&self, namespace: &str, name: &str) -> Option<Issuer> {
        self.issuers
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn add_cluster_issuer(&self, issuer: ClusterIssuer) {
        self.cluster_issuers
            .lock()
            .unwrap()
            .insert(issuer.name_any(), issuer);
    }

    pub fn cluster_issuer(&self, name: &str) -> Option<ClusterIssuer> {
        self.cluster_issuers.lock().unwrap().get(name).cloned()
    }

    pub fn certificate_status_writes(&self) -> usize {
        self.certificate_status_writes.load(Ordering::SeqCst)
    }

    pub fn issuer_status_writes(&self) -> usize {
        self.issuer_status_writes.load(Ordering::SeqCst)
    }

    fn check_status_write(&self) -> Result<(), kube::Error> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(api_error(409, "Conflict"));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateClient for FakeCertificateClient {
    async fn get_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Certificate>, kube::Error> {
        Ok(self.certificate(namespace, name))
    }

    fn tracked_certificates(&self) -> Vec<Arc<Certificate>> {
        self.certificates
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(Arc::new)
            .collect()
    }

    async fn get_issuer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Issuer>, kube::Error> {
        Ok(self.issuer(namespace, name))
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<ClusterIssuer>, kube::Error> {
        Ok(self.cluster_issuer(name))
    }

    async fn replace_certificate_status(
        &self,
        certificate: &Certificate,
    ) -> Result<(), kube::Error> {
        self.check_status_write()?;
        let mut certificates = self.certificates.lock().unwrap();
        let stored = certificates
            .get_mut(&object_key(certificate))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        stored.status = certificate.status.clone();
        self.certificate_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_issuer_status(&self, issuer: &GenericIssuer) -> Result<(), kube::Error> {
        self.check_status_write()?;
        match issuer {
            GenericIssuer::Issuer(issuer) => {
                let mut issuers = self.issuers.lock().unwrap();
                let stored = issuers
                    .get_mut(&object_key(issuer))
                    .ok_or_else(|| api_error(404, "NotFound"))?;
                stored.status = issuer.status.clone();
            }
            GenericIssuer::ClusterIssuer(issuer) => {
                let mut issuers = self.cluster_issuers.lock().unwrap();
                let stored = issuers
                    .get_mut(&issuer.name_any())
                    .ok_or_else(|| api_error(404, "NotFound"))?;
                stored.status = issuer.status.clone();
            }
        }
        self.issuer_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records events as `"<type> <reason> <message>"`.
#[derive(Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<String>>,
}

impl RecordingEventRecorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn record(
        &self,
        _object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{type_} {reason} {message}"));
    }
}

pub struct FixedClock(Mutex<OffsetDateTime>);

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

/// What the next call to [`FakeIssuerBackend::issue`] does.
#[derive(Clone, Debug)]
pub enum FakeIssue {
    /// Returns a self-signed key pair.
    Sign,
    /// Returns a private key without a certificate.
    KeyOnly,
    /// Returns no material at all.
    Defer,
    Fail(String),
    /// Never returns.
    Hang,
}

#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct FakeIssueError {
    message: String,
}

impl IssuerBackendError for FakeIssueError {}

#[derive(Debug)]
pub struct FakeIssuerBackend {
    script: Arc<Mutex<VecDeque<FakeIssue>>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IssuerBackend for FakeIssuerBackend {
    type Error = FakeIssueError;

    async fn issue(&self, certificate: &Certificate) -> Result<Option<KeyPairPem>, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeIssue::Sign);
        let spec = &certificate.spec;
        match next {
            FakeIssue::Sign => Ok(Some(self_signed_pem(spec))),
            FakeIssue::KeyOnly => {
                let key = pki::generate_private_key(spec).unwrap();
                Ok(Some(KeyPairPem {
                    private_key: Unloggable(
                        pki::encode_private_key(&key, spec.key_encoding.unwrap_or_default())
                            .unwrap(),
                    ),
                    ..KeyPairPem::default()
                }))
            }
            FakeIssue::Defer => Ok(None),
            FakeIssue::Fail(message) => FakeIssueSnafu { message }.fail(),
            FakeIssue::Hang => std::future::pending().await,
        }
    }
}

/// Hands out [`FakeIssuerBackend`]s that follow a shared script.
#[derive(Default)]
pub struct FakeIssuerFactory {
    script: Arc<Mutex<VecDeque<FakeIssue>>>,
    calls: Arc<AtomicUsize>,
    pub fail_init: AtomicBool,
}

impl FakeIssuerFactory {
    pub fn push(&self, issue: FakeIssue) {
        self.script.lock().unwrap().push_back(issue);
    }

    /// Number of times any backend was asked to issue.
    pub fn issue_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssuerFactory for FakeIssuerFactory {
    async fn backend_for(&self, _issuer: &GenericIssuer) -> Result<Box<Dynamic>, FromIssuerError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(FromIssuerError::AcmeUnsupported);
        }
        Ok(issuer::dynamic::from(FakeIssuerBackend {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

/// Answers access reviews from a fixed decision, recording every request.
pub struct FakeAccessReviewer {
    decision: Result<bool, String>,
    requests: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeAccessReviewer {
    pub fn allowing(allowed: bool) -> Self {
        Self {
            decision: Ok(allowed),
            requests: Mutex::default(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            decision: Err(message.to_string()),
            requests: Mutex::default(),
        }
    }

    /// The `(user, groups)` of every review so far.
    pub fn requests(&self) -> Vec<(String, Vec<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccessReviewer for FakeAccessReviewer {
    async fn check_access(
        &self,
        _verb: &str,
        _group: &str,
        _resource: &str,
        user: &str,
        groups: &[String],
    ) -> Result<bool, AuthorizationError> {
        self.requests
            .lock()
            .unwrap()
            .push((user.to_string(), groups.to_vec()));
        match &self.decision {
            Ok(allowed) => Ok(*allowed),
            Err(message) => Err(AuthorizationError::Review {
                source: api_error(500, message),
            }),
        }
    }
}
