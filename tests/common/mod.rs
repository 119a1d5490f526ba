#![allow(dead_code)]

use async_trait::async_trait;
use certkeeper::cert::CsrOptions;
use certkeeper::generator::{CertificateGenerator, CertificateResult};
use certkeeper::{CertMonitor, EventKind, MonitorEvent};
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// A self-signed certificate for `domain` expiring at `not_after`.
pub fn self_signed_certificate(
    domain: &str,
    not_after: OffsetDateTime,
) -> anyhow::Result<CertificateResult> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = not_after;
    let certificate = params.self_signed(&key)?.pem();
    Ok(CertificateResult {
        private_key: key.serialize_pem(),
        ca_cert: certificate.clone(),
        certificate,
    })
}

/// Stands in for a CA: issues self-signed certificates valid for 90 days.
#[derive(Default)]
pub struct SelfSignedGenerator {
    calls: AtomicUsize,
}

impl SelfSignedGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateGenerator for SelfSignedGenerator {
    async fn generate(
        &self,
        options: &CsrOptions,
        _account_email: &str,
    ) -> anyhow::Result<CertificateResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self_signed_certificate(
            &options.common_name,
            OffsetDateTime::now_utc() + time::Duration::days(90),
        )
    }
}

/// Records every event a monitor emits.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
}

impl EventLog {
    pub fn attach(monitor: &CertMonitor) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        monitor.on(None, move |event| events.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(MonitorEvent::kind).collect()
    }

    pub async fn wait_for(&self, kind: EventKind) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !self.kinds().contains(&kind) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("no {kind} event within 10s, got {:?}", self.kinds()))
    }
}
