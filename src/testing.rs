use crate::cert::CsrOptions;
use crate::generator::{CertificateGenerator, CertificateResult};
use crate::store::CertStore;
use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::sync::Semaphore;

/// A self-signed certificate for `domain` expiring at `not_after`, shaped like an issued result.
pub fn self_signed_certificate(
    domain: &str,
    not_after: OffsetDateTime,
) -> anyhow::Result<CertificateResult> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = not_after;
    let cert = params.self_signed(&key)?;
    let certificate = cert.pem();
    Ok(CertificateResult {
        private_key: key.serialize_pem(),
        ca_cert: certificate.clone(),
        certificate,
    })
}

#[derive(Default)]
pub struct MemoryCertStore {
    certs: Mutex<HashMap<String, CertificateResult>>,
    writes: AtomicUsize,
}

impl MemoryCertStore {
    pub fn with_cert(common_name: &str, result: CertificateResult) -> Self {
        let store = Self::default();
        store.certs.lock().insert(common_name.to_string(), result);
        store
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn prepare(&self, _common_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn has_cert(&self, common_name: &str) -> anyhow::Result<bool> {
        Ok(self.certs.lock().contains_key(common_name))
    }

    async fn get_cert(&self, common_name: &str) -> anyhow::Result<Vec<u8>> {
        self.certs
            .lock()
            .get(common_name)
            .map(|result| result.certificate.clone().into_bytes())
            .context(format!("no certificate for {common_name}"))
    }

    async fn store(&self, common_name: &str, result: &CertificateResult) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.certs
            .lock()
            .insert(common_name.to_string(), result.clone());
        Ok(())
    }
}

/// Issues self-signed certificates valid for `validity`. Optionally fails, or blocks until
/// [`FakeGenerator::release`] is called.
pub struct FakeGenerator {
    validity: time::Duration,
    fail: AtomicBool,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeGenerator {
    pub fn new(validity: time::Duration) -> Self {
        Self {
            validity,
            fail: AtomicBool::new(false),
            gate: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(validity: time::Duration) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(validity)
        }
    }

    pub fn failing() -> Self {
        let generator = Self::new(time::Duration::days(90));
        generator.fail.store(true, Ordering::SeqCst);
        generator
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(common name, account email)` of every call so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CertificateGenerator for FakeGenerator {
    async fn generate(
        &self,
        csr_options: &CsrOptions,
        account_email: &str,
    ) -> anyhow::Result<CertificateResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .push((csr_options.common_name.clone(), account_email.to_string()));
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("CA unavailable for {}", csr_options.common_name);
        }
        self_signed_certificate(
            &csr_options.common_name,
            OffsetDateTime::now_utc() + self.validity,
        )
    }
}
