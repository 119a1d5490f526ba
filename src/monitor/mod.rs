//! The certificate monitor: watches a set of domains and keeps their certificates fresh.
//!
//! Every period, all watched domains are evaluated through the [`CertHandler`], at most
//! [`BATCH_SIZE`] at a time. Domains added while the monitor runs are evaluated right away on
//! a separate, serial batcher.

use crate::batch::{Task, TaskBatcher, task};
use crate::handler::{CertHandler, GenerateOutcome};
use crate::timer::repeat_until_cancelled;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod event;

pub use event::{EventKind, Listener, MonitorEvent};
use event::Listeners;

pub const BATCH_SIZE: usize = 5;
pub const ADDITION_BATCH_SIZE: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("The certificate monitor is already running")]
    AlreadyRunning,
}

#[derive(Clone)]
pub struct CertMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<CertHandler>,
    domains: Mutex<BTreeMap<String, String>>,
    listeners: Listeners,
    batcher: Arc<TaskBatcher>,
    addition_batcher: Arc<TaskBatcher>,
    run: Mutex<Option<RunState>>,
    next_run_id: AtomicU64,
}

struct RunState {
    context: RunContext,
    runtime: tokio::runtime::Handle,
}

/// Shared by everything spawned during one `start`..`stop` cycle.
#[derive(Clone)]
struct RunContext {
    id: u64,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
}

impl RunContext {
    fn fail(&self, error: anyhow::Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

/// Stops its run when `start` returns or its future is dropped.
struct RunGuard<'a> {
    monitor: &'a CertMonitor,
    id: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.monitor.stop_run(Some(self.id));
    }
}

impl CertMonitor {
    pub fn new(handler: Arc<CertHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                domains: Mutex::new(BTreeMap::new()),
                listeners: Listeners::default(),
                batcher: Arc::new(TaskBatcher::new(BATCH_SIZE)),
                addition_batcher: Arc::new(TaskBatcher::new(ADDITION_BATCH_SIZE)),
                run: Mutex::new(None),
                next_run_id: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the watched domains (domain => account email). Domains that were not watched
    /// before are evaluated immediately if the monitor is running.
    pub fn set<I, K, V>(&self, domains: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let domains: BTreeMap<String, String> = domains
            .into_iter()
            .map(|(domain, email)| (domain.into(), email.into()))
            .collect();
        let additions: Vec<(String, String)> = {
            let mut watched = self.inner.domains.lock();
            for removed in watched.keys().filter(|domain| !domains.contains_key(*domain)) {
                info!("No longer watching {removed}");
            }
            let additions = domains
                .iter()
                .filter(|(domain, _)| !watched.contains_key(*domain))
                .map(|(domain, email)| (domain.clone(), email.clone()))
                .collect();
            *watched = domains;
            additions
        };
        if additions.is_empty() {
            return;
        }
        let running = self
            .inner
            .run
            .lock()
            .as_ref()
            .map(|state| (state.context.clone(), state.runtime.clone()));
        let Some((run, runtime)) = running else {
            return;
        };
        debug!("Evaluating {} newly added domain(s) now", additions.len());
        let tasks: Vec<Task> = additions
            .into_iter()
            .map(|(domain, email)| self.create_task(&run, domain, email))
            .collect();
        let batcher = Arc::clone(&self.inner.addition_batcher);
        runtime.spawn(async move {
            batcher.add_and_run(tasks).await;
        });
    }

    /// Snapshot of the watched domains.
    pub fn domains(&self) -> BTreeMap<String, String> {
        self.inner.domains.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Subscribe `callback` to the given event kinds, or to all of them.
    pub fn on<F>(&self, kinds: Option<&[EventKind]>, callback: F)
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(kinds, Arc::new(callback));
    }

    /// Evaluate all watched domains now and then every `frequency_minutes`, until
    /// [`CertMonitor::stop`] is called. Fails with [`MonitorError::AlreadyRunning`] if the
    /// monitor is running already, and with the error of a failed evaluation if nobody listens
    /// for [`EventKind::Error`].
    pub async fn start(&self, frequency_minutes: u64) -> anyhow::Result<()> {
        let run = {
            let mut slot = self.inner.run.lock();
            if slot.is_some() {
                return Err(MonitorError::AlreadyRunning.into());
            }
            let context = RunContext {
                id: self.inner.next_run_id.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                failure: Arc::default(),
            };
            *slot = Some(RunState {
                context: context.clone(),
                runtime: tokio::runtime::Handle::current(),
            });
            context
        };
        let _guard = RunGuard {
            monitor: self,
            id: run.id,
        };
        if frequency_minutes == 0 {
            warn!("A check frequency of 0 minutes is not supported, checking every minute");
        }
        let period = Duration::from_secs(frequency_minutes.max(1).saturating_mul(60));
        info!(
            "Certificate monitor started, checking every {}",
            crate::time::humanize_duration(period)
        );
        self.inner.listeners.emit(&MonitorEvent::Started);

        repeat_until_cancelled(period, &run.cancel, || self.tick(&run)).await;

        let failure = run.failure.lock().take();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stop the periodic checks. Evaluations already underway finish in the background. Does
    /// nothing if the monitor is not running.
    pub fn stop(&self) {
        self.stop_run(None);
    }

    fn stop_run(&self, id: Option<u64>) {
        let stopped = {
            let mut slot = self.inner.run.lock();
            let matches = slot
                .as_ref()
                .is_some_and(|state| id.is_none_or(|id| id == state.context.id));
            if matches { slot.take() } else { None }
        };
        if let Some(state) = stopped {
            state.context.cancel.cancel();
            info!("Certificate monitor stopped");
            self.inner.listeners.emit(&MonitorEvent::Stopped);
        }
    }

    async fn tick(&self, run: &RunContext) {
        let domains = self.domains();
        if domains.is_empty() {
            debug!("No domains to check");
            return;
        }
        debug!("Checking {} domain(s)", domains.len());
        let tasks: Vec<Task> = domains
            .into_iter()
            .map(|(domain, email)| self.create_task(run, domain, email))
            .collect();
        self.inner.batcher.add_and_run(tasks).await;
    }

    fn create_task(&self, run: &RunContext, domain: String, email: String) -> Task {
        let monitor = self.clone();
        let run = run.clone();
        task(move || async move {
            match monitor
                .inner
                .handler
                .generate_or_renew_certificate(&domain, &email)
                .await
            {
                Ok(outcome) => monitor.report(outcome, domain, email),
                Err(e) => monitor.handle_failure(&run, &domain, e),
            }
            Ok(())
        })
    }

    fn report(&self, outcome: GenerateOutcome, domain: String, email: String) {
        let event = match outcome {
            GenerateOutcome::Created => {
                info!("Issued certificate for {domain}");
                MonitorEvent::Generated { domain, email }
            }
            GenerateOutcome::Renewed => {
                info!("Renewed certificate for {domain}");
                MonitorEvent::Renewed { domain, email }
            }
            GenerateOutcome::Skipped => MonitorEvent::Skipped { domain, email },
            GenerateOutcome::InProgress => {
                debug!("{domain} is already being processed");
                return;
            }
        };
        self.inner.listeners.emit(&event);
    }

    fn handle_failure(&self, run: &RunContext, domain: &str, error: anyhow::Error) {
        let error = error.context(format!("Processing certificate for {domain} failed"));
        if self.inner.listeners.count(EventKind::Error) > 0 {
            warn!("{error:#}");
            self.inner
                .listeners
                .emit(&MonitorEvent::Error(Arc::new(error)));
        } else {
            error!("Unhandled error, stopping certificate monitor: {error:#}");
            run.fail(error);
            self.stop_run(Some(run.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CertStore;
    use crate::testing::{FakeGenerator, MemoryCertStore, self_signed_certificate};
    use time::OffsetDateTime;

    struct Fixture {
        monitor: CertMonitor,
        generator: Arc<FakeGenerator>,
        store: Arc<MemoryCertStore>,
        events: Arc<Mutex<Vec<MonitorEvent>>>,
    }

    impl Fixture {
        fn new(generator: FakeGenerator, store: MemoryCertStore) -> Self {
            let generator = Arc::new(generator);
            let store = Arc::new(store);
            let handler = CertHandler::new(generator.clone(), store.clone(), 30);
            Self {
                monitor: CertMonitor::new(Arc::new(handler)),
                generator,
                store,
                events: Arc::default(),
            }
        }

        fn record(&self, kinds: Option<&[EventKind]>) {
            let events = self.events.clone();
            self.monitor
                .on(kinds, move |event| events.lock().push(event.clone()));
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().iter().map(MonitorEvent::kind).collect()
        }

        async fn wait_for(&self, kind: EventKind) {
            tokio::time::timeout(Duration::from_secs(10), async {
                while !self.kinds().contains(&kind) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("no {kind} event within 10s, got {:?}", self.kinds()));
        }

        fn spawn_start(&self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
            let monitor = self.monitor.clone();
            tokio::spawn(async move { monitor.start(60).await })
        }
    }

    #[test]
    fn test_set_replaces_mapping() {
        let fixture = Fixture::new(
            FakeGenerator::new(time::Duration::days(90)),
            MemoryCertStore::default(),
        );

        fixture.monitor.set([("a.example", "e1@example.com")]);
        fixture.monitor.set([("b.example", "e2@example.com")]);

        assert_eq!(
            fixture.monitor.domains(),
            BTreeMap::from([("b.example".to_string(), "e2@example.com".to_string())])
        );
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let fixture = Fixture::new(
            FakeGenerator::new(time::Duration::days(90)),
            MemoryCertStore::default(),
        );
        fixture.record(None);

        fixture.monitor.stop();

        assert!(!fixture.monitor.is_running());
        assert!(fixture.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_tick_generates_and_stop_ends_start() -> anyhow::Result<()> {
        let fixture = Fixture::new(
            FakeGenerator::new(time::Duration::days(90)),
            MemoryCertStore::default(),
        );
        fixture.record(None);
        fixture.monitor.set([("example.com", "me@example.com")]);

        let running = fixture.spawn_start();
        fixture.wait_for(EventKind::Generated).await;
        assert!(fixture.monitor.is_running());

        let err = fixture.monitor.start(60).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MonitorError>(),
            Some(MonitorError::AlreadyRunning)
        ));

        fixture.monitor.stop();
        running.await??;

        assert_eq!(
            fixture.kinds(),
            vec![EventKind::Started, EventKind::Generated, EventKind::Stopped]
        );
        let events = fixture.events.lock().clone();
        assert!(matches!(
            &events[1],
            MonitorEvent::Generated { domain, email } if domain == "example.com" && email == "me@example.com"
        ));
        assert!(fixture.store.has_cert("example.com").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_skipped_and_renewed_events() -> anyhow::Result<()> {
        let fresh = self_signed_certificate(
            "fresh.example",
            OffsetDateTime::now_utc() + time::Duration::days(60),
        )?;
        let stale = self_signed_certificate(
            "stale.example",
            OffsetDateTime::now_utc() + time::Duration::days(3),
        )?;
        let store = MemoryCertStore::with_cert("fresh.example", fresh);
        store.store("stale.example", &stale).await?;
        let fixture = Fixture::new(FakeGenerator::new(time::Duration::days(90)), store);
        fixture.record(Some(&[EventKind::Renewed, EventKind::Skipped]));
        fixture.monitor.set([
            ("fresh.example", "me@example.com"),
            ("stale.example", "me@example.com"),
        ]);

        let running = fixture.spawn_start();
        fixture.wait_for(EventKind::Renewed).await;
        fixture.wait_for(EventKind::Skipped).await;
        fixture.monitor.stop();
        running.await??;

        let events = fixture.events.lock().clone();
        let domains: Vec<(EventKind, &str)> = events
            .iter()
            .filter_map(|event| event.domain().map(|domain| (event.kind(), domain)))
            .collect();
        assert!(domains.contains(&(EventKind::Renewed, "stale.example")));
        assert!(domains.contains(&(EventKind::Skipped, "fresh.example")));
        assert_eq!(fixture.generator.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unhandled_error_stops_monitor() {
        let fixture = Fixture::new(FakeGenerator::failing(), MemoryCertStore::default());
        fixture.record(Some(&[EventKind::Started, EventKind::Stopped]));
        fixture.monitor.set([("example.com", "me@example.com")]);

        let result = tokio::time::timeout(Duration::from_secs(10), fixture.monitor.start(60))
            .await
            .expect("start must return after an unhandled error");

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("CA unavailable"), "{err:#}");
        assert!(!fixture.monitor.is_running());
        assert_eq!(fixture.kinds(), vec![EventKind::Started, EventKind::Stopped]);
    }

    #[tokio::test]
    async fn test_handled_error_keeps_running() -> anyhow::Result<()> {
        let fixture = Fixture::new(FakeGenerator::failing(), MemoryCertStore::default());
        fixture.record(Some(&[EventKind::Error]));
        fixture.monitor.set([("example.com", "me@example.com")]);

        let running = fixture.spawn_start();
        fixture.wait_for(EventKind::Error).await;
        assert!(fixture.monitor.is_running());

        fixture.monitor.stop();
        running.await??;
        assert_eq!(fixture.store.writes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_added_domain_is_processed_immediately() -> anyhow::Result<()> {
        let fixture = Fixture::new(
            FakeGenerator::new(time::Duration::days(90)),
            MemoryCertStore::default(),
        );
        fixture.record(None);

        let running = fixture.spawn_start();
        fixture.wait_for(EventKind::Started).await;
        fixture.monitor.set([("late.example", "me@example.com")]);
        fixture.wait_for(EventKind::Generated).await;

        fixture.monitor.stop();
        running.await??;
        assert_eq!(
            fixture.generator.requests(),
            vec![("late.example".to_string(), "me@example.com".to_string())]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_domain_is_not_renewed() -> anyhow::Result<()> {
        // Certificates always fall below the threshold, so every tick renews what is watched
        let fixture = Fixture::new(
            FakeGenerator::new(time::Duration::days(10)),
            MemoryCertStore::default(),
        );
        fixture.record(None);
        fixture.monitor.set([("a.example", "me@example.com")]);

        let running = tokio::spawn({
            let monitor = fixture.monitor.clone();
            async move { monitor.start(1).await }
        });
        fixture.wait_for(EventKind::Generated).await;
        fixture.monitor.set([("b.example", "me@example.com")]);
        tokio::time::timeout(Duration::from_secs(600), async {
            while !fixture.kinds().contains(&EventKind::Renewed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await?;

        fixture.monitor.stop();
        running.await??;
        let requested: Vec<String> = fixture
            .generator
            .requests()
            .into_iter()
            .map(|(domain, _)| domain)
            .collect();
        assert_eq!(requested, vec!["a.example", "b.example", "b.example"]);
        Ok(())
    }
}
