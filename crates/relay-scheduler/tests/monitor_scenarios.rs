use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    AttachmentSource, BlobStore, CoreError, CreatedTicket, DedupRule, Environment, HistoryEvent,
    HousekeepingFilter, MailSender, MonitorSettings, NewTicketRequest, OutboundMail,
    SettingsSource, StaticSettings, TicketCreator, TicketHistorySource, TicketId,
};
use relay_dedup::{DedupGuard, InboundMessage, IntakeOutcome, IntakePipeline, IntakePolicy};
use relay_history::DeliveryTracker;
use relay_ledger::{IdentifierLedger, InMemoryBlobStore, LedgerStore, SnapshotLedger};
use relay_notify::{FlowRules, NotificationDispatcher, NotifySettings};
use relay_scheduler::{MonitorCycle, PollingScheduler, SchedulerState, ERROR_BACKOFF};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

#[derive(Default)]
struct StubHistory {
    histories: Mutex<HashMap<String, Result<Vec<HistoryEvent>, CoreError>>>,
    fetches: AtomicUsize,
}

impl StubHistory {
    async fn set(&self, ticket: &str, newest_first: &[&str]) {
        let events = newest_first
            .iter()
            .map(|text| HistoryEvent::comment("2026-03-01T10:00:00Z", "ana", *text))
            .collect();
        self.histories
            .lock()
            .await
            .insert(ticket.to_owned(), Ok(events));
    }

    async fn fail(&self, ticket: &str) {
        self.histories.lock().await.insert(
            ticket.to_owned(),
            Err(CoreError::DependencyUnavailable("source timeout".to_owned())),
        );
    }
}

#[async_trait]
impl TicketHistorySource for StubHistory {
    async fn fetch(
        &self,
        ticket_id: &TicketId,
        _environment: &Environment,
    ) -> Result<Vec<HistoryEvent>, CoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.histories
            .lock()
            .await
            .get(ticket_id.as_str())
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
struct StubMail {
    sent: Mutex<Vec<OutboundMail>>,
}

#[async_trait]
impl MailSender for StubMail {
    async fn send(&self, mail: OutboundMail) -> Result<(), CoreError> {
        self.sent.lock().await.push(mail);
        Ok(())
    }
}

struct NoAttachments;

#[async_trait]
impl AttachmentSource for NoAttachments {
    async fn fetch(
        &self,
        _ticket_id: &TicketId,
        _environment: &Environment,
        _name: &str,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(None)
    }
}

struct UnreachableBlobStore;

#[async_trait]
impl BlobStore for UnreachableBlobStore {
    async fn read(&self, _name: &str) -> Result<Option<String>, CoreError> {
        Err(CoreError::BackendUnreachable("blob host down".to_owned()))
    }

    async fn write(&self, _name: &str, _text: &str) -> Result<(), CoreError> {
        Err(CoreError::BackendUnreachable("blob host down".to_owned()))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>, CoreError> {
        Err(CoreError::BackendUnreachable("blob host down".to_owned()))
    }
}

/// In-memory blobs whose listing can be switched to fail.
#[derive(Default)]
struct FlakyListing {
    inner: InMemoryBlobStore,
    fail_list: AtomicBool,
}

#[async_trait]
impl BlobStore for FlakyListing {
    async fn read(&self, name: &str) -> Result<Option<String>, CoreError> {
        self.inner.read(name).await
    }

    async fn write(&self, name: &str, text: &str) -> Result<(), CoreError> {
        self.inner.write(name, text).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CoreError::Persistence("listing timed out".to_owned()));
        }
        self.inner.list(prefix).await
    }
}

enum SettingsStep {
    Give(MonitorSettings),
    Fail,
    Panic,
}

/// Hands out scripted settings, then stays disabled for an hour at a time.
/// Records when each snapshot was taken.
#[derive(Default)]
struct ScriptedSettings {
    steps: std::sync::Mutex<VecDeque<SettingsStep>>,
    taken_at: std::sync::Mutex<Vec<Instant>>,
}

impl ScriptedSettings {
    fn new(steps: Vec<SettingsStep>) -> Self {
        Self {
            steps: std::sync::Mutex::new(steps.into()),
            taken_at: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn gaps(&self) -> Vec<u64> {
        let taken = self.taken_at.lock().expect("taken_at lock");
        taken
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }
}

impl SettingsSource for ScriptedSettings {
    fn snapshot(&self) -> Result<MonitorSettings, CoreError> {
        self.taken_at
            .lock()
            .expect("taken_at lock")
            .push(Instant::now());
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(SettingsStep::Give(settings)) => Ok(settings),
            Some(SettingsStep::Fail) => Err(CoreError::Configuration("config unreadable".to_owned())),
            Some(SettingsStep::Panic) => panic!("settings source blew up"),
            None => Ok(MonitorSettings {
                enabled: false,
                interval: Duration::from_secs(3600),
                excluded_senders: Vec::new(),
            }),
        }
    }
}

fn every(minutes: u64, enabled: bool) -> SettingsStep {
    SettingsStep::Give(MonitorSettings {
        enabled,
        interval: Duration::from_secs(minutes * 60),
        excluded_senders: Vec::new(),
    })
}

struct SequentialCreator {
    next: Mutex<u32>,
}

#[async_trait]
impl TicketCreator for SequentialCreator {
    async fn create_ticket(&self, _request: NewTicketRequest) -> Result<CreatedTicket, CoreError> {
        let mut next = self.next.lock().await;
        *next += 1;
        Ok(CreatedTicket {
            ticket_id: TicketId::new(next.to_string()),
            environment: Environment::default(),
        })
    }
}

fn settings(excluded: &[&str]) -> MonitorSettings {
    MonitorSettings {
        enabled: true,
        interval: Duration::from_millis(20),
        excluded_senders: excluded.iter().map(|s| (*s).to_owned()).collect(),
    }
}

struct Harness {
    history: Arc<StubHistory>,
    mail: Arc<StubMail>,
    store: LedgerStore,
    snapshots: SnapshotLedger,
    scheduler: PollingScheduler,
}

impl Harness {
    fn new(settings: MonitorSettings) -> Self {
        Self::with_blob(Arc::new(InMemoryBlobStore::new()), settings)
    }

    fn with_blob(blob: Arc<dyn BlobStore>, settings: MonitorSettings) -> Self {
        Self::build(
            blob,
            Arc::new(StaticSettings(settings)),
            Duration::from_millis(20),
        )
    }

    fn with_settings_source(blob: Arc<dyn BlobStore>, settings: Arc<dyn SettingsSource>) -> Self {
        Self::build(blob, settings, ERROR_BACKOFF)
    }

    fn build(blob: Arc<dyn BlobStore>, settings: Arc<dyn SettingsSource>, backoff: Duration) -> Self {
        let history = Arc::new(StubHistory::default());
        let mail = Arc::new(StubMail::default());
        let store = LedgerStore::new(blob);
        let snapshots = SnapshotLedger::new(store.clone());
        let dispatcher = NotificationDispatcher::new(
            mail.clone(),
            Arc::new(NoAttachments),
            DeliveryTracker::new(snapshots.clone()),
            FlowRules::new(),
            NotifySettings::default(),
        );
        let cycle = MonitorCycle::new(
            history.clone(),
            snapshots.clone(),
            dispatcher,
            HousekeepingFilter::default(),
        );
        let scheduler = PollingScheduler::new(Arc::new(cycle), settings).with_backoff(backoff);
        Self {
            history,
            mail,
            store,
            snapshots,
            scheduler,
        }
    }

    async fn register(&self, ticket: &str, sender: &str) {
        self.snapshots
            .register(
                TicketId::new(ticket),
                Environment::default(),
                Some(sender.to_owned()),
            )
            .await
            .expect("register ticket");
    }

    async fn sent_texts(&self) -> Vec<String> {
        self.mail
            .sent
            .lock()
            .await
            .iter()
            .map(|mail| mail.text.clone())
            .collect()
    }
}

#[tokio::test]
async fn growing_history_is_delivered_exactly_once() {
    let harness = Harness::new(settings(&[]));
    harness.register("812", "ana@example.com").await;

    harness.history.set("812", &["c3", "c2", "c1"]).await;
    let first = harness.scheduler.run_once().await.expect("first cycle");
    harness.history.set("812", &["c4", "c3", "c2", "c1"]).await;
    let second = harness.scheduler.run_once().await.expect("second cycle");
    let third = harness.scheduler.run_once().await.expect("third cycle");

    assert_eq!(first.notified, 1);
    assert_eq!(second.notified, 1);
    assert_eq!(third.notified, 0);
    let texts = harness.sent_texts().await;
    assert_eq!(texts.len(), 2);
    for comment in ["c1", "c2", "c3"] {
        assert!(texts[0].contains(comment));
        assert!(!texts[1].contains(comment));
    }
    assert!(texts[1].contains("c4"));
}

#[tokio::test]
async fn failing_ticket_does_not_block_the_others() {
    let harness = Harness::new(settings(&[]));
    harness.register("1", "ana@example.com").await;
    harness.register("2", "bruno@example.com").await;
    harness.history.fail("1").await;
    harness.history.set("2", &["hello"]).await;

    let report = harness.scheduler.run_once().await.expect("cycle");

    assert_eq!(report.checked, 2);
    assert_eq!(report.notified, 1);
    let sent = harness.mail.sent.lock().await;
    assert_eq!(sent[0].recipient, "bruno@example.com");
}

#[tokio::test]
async fn failed_fetch_leaves_snapshot_untouched() {
    let harness = Harness::new(settings(&[]));
    harness.register("1", "ana@example.com").await;
    harness.history.set("1", &["c2", "c1"]).await;
    harness.scheduler.run_once().await.expect("first cycle");
    let before = harness
        .snapshots
        .load(&TicketId::new("1"))
        .await
        .expect("load")
        .expect("snapshot");

    harness.history.fail("1").await;
    harness.scheduler.run_once().await.expect("failing cycle");
    harness.history.set("1", &[]).await;
    harness.scheduler.run_once().await.expect("empty cycle");

    let after = harness
        .snapshots
        .load(&TicketId::new("1"))
        .await
        .expect("load")
        .expect("snapshot");
    assert_eq!(before, after);
    assert_eq!(after.items.len(), 2);
}

#[tokio::test]
async fn excluded_sender_is_skipped_entirely() {
    let harness = Harness::new(settings(&["Robot@Example.com"]));
    harness.register("5", "robot@example.com").await;
    harness.history.set("5", &["c1"]).await;

    let report = harness.scheduler.run_once().await.expect("cycle");

    assert_eq!(report.skipped, 1);
    assert!(harness.sent_texts().await.is_empty());
    let snapshot = harness
        .snapshots
        .load(&TicketId::new("5"))
        .await
        .expect("load")
        .expect("snapshot");
    assert!(snapshot.items.is_empty());
}

#[tokio::test]
async fn housekeeping_marker_is_never_delivered() {
    let harness = Harness::new(settings(&[]));
    harness.register("9", "ana@example.com").await;
    harness
        .history
        .set("9", &["first reply", "Registro criado"])
        .await;

    harness.scheduler.run_once().await.expect("cycle");

    let texts = harness.sent_texts().await;
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("first reply"));
    assert!(!texts[0].contains("Registro criado"));
    let snapshot = harness
        .snapshots
        .load(&TicketId::new("9"))
        .await
        .expect("load")
        .expect("snapshot");
    assert_eq!(snapshot.items.len(), 1);
}

#[tokio::test]
async fn background_worker_delivers_and_stops() {
    let harness = Harness::new(settings(&[]));
    harness.register("812", "ana@example.com").await;
    harness.history.set("812", &["c1"]).await;

    harness.scheduler.start().await.expect("start");
    harness.scheduler.start().await.expect("second start is a no-op");
    assert_eq!(harness.scheduler.state().await, SchedulerState::Running);

    timeout(Duration::from_secs(2), async {
        loop {
            if !harness.mail.sent.lock().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should deliver the pending item");

    harness.history.set("812", &["c2", "c1"]).await;
    timeout(Duration::from_secs(2), async {
        loop {
            if harness.mail.sent.lock().await.len() >= 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should pick up the new item");

    harness.scheduler.stop().await.expect("stop");
    harness.scheduler.stop().await.expect("second stop is a no-op");
    assert_eq!(harness.scheduler.state().await, SchedulerState::Stopped);
    assert!(harness.scheduler.last_report().await.is_some());
    assert_eq!(harness.sent_texts().await.len(), 2);
}

#[tokio::test]
async fn disabled_monitor_does_no_work() {
    let mut disabled = settings(&[]);
    disabled.enabled = false;
    let harness = Harness::new(disabled);
    harness.register("812", "ana@example.com").await;
    harness.history.set("812", &["c1"]).await;

    harness.scheduler.start().await.expect("start");
    sleep(Duration::from_millis(80)).await;
    harness.scheduler.stop().await.expect("stop");

    assert!(harness.sent_texts().await.is_empty());
    assert!(harness.scheduler.last_report().await.is_none());
}

#[tokio::test]
async fn unreachable_backend_refuses_to_start() {
    let harness = Harness::with_blob(Arc::new(UnreachableBlobStore), settings(&[]));

    let error = harness
        .scheduler
        .start()
        .await
        .expect_err("start should fail");

    assert!(error.is_backend_unreachable());
    assert_eq!(harness.scheduler.state().await, SchedulerState::Stopped);
}

#[tokio::test]
async fn created_ticket_becomes_monitored() {
    let harness = Harness::new(settings(&[]));
    let guard = DedupGuard::new(
        &[DedupRule::keyword("MAC:")],
        &[],
        IdentifierLedger::new(harness.store.clone()),
    );
    let intake = IntakePipeline::new(
        guard,
        harness.snapshots.clone(),
        Arc::new(SequentialCreator {
            next: Mutex::new(100),
        }),
        IntakePolicy::default(),
    );
    let message = InboundMessage {
        from: "Ana <ana@example.com>".to_owned(),
        subject: "Router offline".to_owned(),
        body: "MAC: AABBCCDDEEFF".to_owned(),
    };

    let created = intake.process(&message).await.expect("intake");
    let repeated = intake.process(&message).await.expect("repeat intake");
    harness.history.set("101", &["Technician assigned"]).await;
    let report = harness.scheduler.run_once().await.expect("cycle");

    assert!(matches!(created, IntakeOutcome::Created { ref ticket_id, .. } if ticket_id.as_str() == "101"));
    assert!(matches!(repeated, IntakeOutcome::Duplicate { .. }));
    assert_eq!(report.notified, 1);
    let sent = harness.mail.sent.lock().await;
    assert_eq!(sent[0].recipient, "ana@example.com");
    assert_eq!(sent[0].subject, "Update on ticket #101");
}

#[tokio::test(start_paused = true)]
async fn worker_rereads_enabled_and_interval_every_cycle() {
    let settings = Arc::new(ScriptedSettings::new(vec![
        every(10, true),
        every(30, false),
        every(5, true),
    ]));
    let harness =
        Harness::with_settings_source(Arc::new(InMemoryBlobStore::new()), settings.clone());
    harness.register("812", "ana@example.com").await;
    harness.history.set("812", &["c1"]).await;

    harness.scheduler.start().await.expect("start");
    sleep(Duration::from_secs(3600)).await;
    harness.scheduler.stop().await.expect("stop");

    assert_eq!(settings.gaps(), vec![600, 1800, 300]);
    assert_eq!(harness.history.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(harness.sent_texts().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn settings_and_cycle_errors_back_off_for_five_minutes() {
    let blob = Arc::new(FlakyListing::default());
    let settings = Arc::new(ScriptedSettings::new(vec![
        SettingsStep::Fail,
        every(1, true),
    ]));
    let harness = Harness::with_settings_source(blob.clone(), settings.clone());
    harness.register("812", "ana@example.com").await;
    harness.history.set("812", &["c1"]).await;

    harness.scheduler.start().await.expect("start");
    blob.fail_list.store(true, Ordering::SeqCst);
    sleep(Duration::from_secs(700)).await;
    harness.scheduler.stop().await.expect("stop");

    assert_eq!(ERROR_BACKOFF, Duration::from_secs(300));
    assert_eq!(settings.gaps(), vec![300, 300]);
    assert_eq!(harness.scheduler.state().await, SchedulerState::Stopped);
    assert!(harness.scheduler.last_report().await.is_none());
    assert!(harness.sent_texts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dead_worker_can_be_restarted() {
    let settings = Arc::new(ScriptedSettings::new(vec![SettingsStep::Panic]));
    let harness =
        Harness::with_settings_source(Arc::new(InMemoryBlobStore::new()), settings.clone());

    harness.scheduler.start().await.expect("start");
    sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.scheduler.state().await, SchedulerState::Stopped);

    harness.scheduler.start().await.expect("restart");
    assert_eq!(harness.scheduler.state().await, SchedulerState::Running);
    sleep(Duration::from_millis(10)).await;
    harness.scheduler.stop().await.expect("stop");

    assert_eq!(settings.taken_at.lock().expect("taken_at lock").len(), 2);
}
