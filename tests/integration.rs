use std::{
    collections::HashSet,
    future::Future,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use courier::{
    config::Config,
    message::{headers, FailedInfo, MediumMessage, MessageId, MessageKind, Status, TransportMessage},
    service::Service,
    storage::{sqlite::SqliteStorage, DataStorage, MessageQuery},
    subscriber::SubscriberRegistry,
    transport::{memory::InMemoryBroker, ConsumerClientFactory, OperateResult, Transport},
};
use futures_util::future::BoxFuture;
use serde_json::json;
use tempfile::TempDir;

struct TmpService {
    svc: Service<SqliteStorage>,
    broker: InMemoryBroker,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service<SqliteStorage>;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

fn config(dir: &TempDir) -> Config {
    Config {
        db_path: Some(dir.path().join("courier.db").to_string_lossy().to_string()),
        failed_retry_interval_ms: 50,
        retry_backoff_base_ms: 10,
        retry_backoff_max_ms: 50,
        fallback_window_lookback_secs: 0,
        delayed_poll_interval_ms: 50,
        listen_timeout_ms: 20,
        shutdown_grace_ms: 2_000,
        ..Default::default()
    }
}

#[derive(Default)]
struct Setup {
    config: Option<Config>,
    transport: Option<Arc<dyn Transport>>,
    registry: SubscriberRegistry,
    failed: Option<Arc<Mutex<Vec<FailedInfo>>>>,
}

async fn setup() -> TmpService {
    setup_with(Setup::default()).await
}

async fn setup_with(setup: Setup) -> TmpService {
    let tmpdir = tempfile::tempdir().unwrap();
    let config = setup.config.unwrap_or_else(|| config(&tmpdir));
    let broker = InMemoryBroker::new();

    // Bind every group up front so nothing published early is lost.
    for (group, topics) in setup.registry.clone().resolve(&config).groups() {
        broker.create(&group).await.unwrap().subscribe(topics).await.unwrap();
    }

    let svc = launch(config, &broker, setup.transport, setup.registry, setup.failed).await;

    TmpService {
        svc,
        broker,
        tmpdir,
    }
}

async fn launch(
    config: Config,
    broker: &InMemoryBroker,
    transport: Option<Arc<dyn Transport>>,
    registry: SubscriberRegistry,
    failed: Option<Arc<Mutex<Vec<FailedInfo>>>>,
) -> Service<SqliteStorage> {
    let callback = failed.map(|failed| {
        Arc::new(move |info: FailedInfo| failed.lock().unwrap().push(info))
            as courier::state::FailedThresholdCallback
    });

    Service::launch()
        .storage(SqliteStorage::connect(&config).await.unwrap())
        .config(config)
        .transport(transport.unwrap_or_else(|| Arc::new(broker.clone())))
        .consumer_factory(Arc::new(broker.clone()))
        .registry(registry)
        .maybe_failed_threshold_callback(callback)
        .start()
        .await
        .unwrap()
}

impl TmpService {
    async fn message(&self, kind: MessageKind, id: MessageId) -> MediumMessage {
        self.storage().get_message(kind, id).await.unwrap().unwrap()
    }

    async fn received(&self, group: &str) -> Vec<MediumMessage> {
        self.storage()
            .query_messages(
                MessageKind::Received,
                MessageQuery {
                    group: Some(group.to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }
}

async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Fails the first `failures` sends, then delegates.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
    inner: InMemoryBroker,
}

impl Transport for Flaky {
    fn address(&self) -> &str {
        "flaky://"
    }

    fn send(&self, message: TransportMessage) -> BoxFuture<'_, OperateResult> {
        Box::pin(async move {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                OperateResult::failed("connection refused")
            } else {
                self.inner.send(message).await
            }
        })
    }
}

#[tokio::test]
async fn test_publish_is_delivered() {
    let service = setup().await;

    let id = service
        .publisher()
        .publish("order.created", &json!({ "orderId": 123 }))
        .await
        .unwrap();

    let s = &service;
    wait_until("publish to succeed", move || async move {
        s.message(MessageKind::Published, id).await.status == Status::Succeeded
    })
    .await;

    let row = service.message(MessageKind::Published, id).await;
    let expires_in = row.expires_at.unwrap() - Utc::now();
    assert!(expires_in > chrono::Duration::minutes(59));
    assert!(expires_in <= chrono::Duration::hours(1));
    assert_eq!(row.retries, 0);

    let sent = service.broker.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].name(), Some("order.created"));
    assert_eq!(sent[0].body.as_ref(), br#"{"orderId":123}"#);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let tmpdir = tempfile::tempdir().unwrap();
    let failed = Arc::new(Mutex::new(Vec::new()));
    let service = setup_with(Setup {
        config: Some(Config {
            failed_retry_count: 3,
            ..config(&tmpdir)
        }),
        transport: Some(Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            inner: InMemoryBroker::new(),
        })),
        failed: Some(failed.clone()),
        ..Default::default()
    })
    .await;

    let id = service.publisher().publish("order.created", &1).await.unwrap();

    let s = &service;
    wait_until("message to fail", move || async move {
        s.message(MessageKind::Published, id).await.status == Status::Failed
    })
    .await;

    // Give the sweeps a few more rounds to prove nothing runs again.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = service.message(MessageKind::Published, id).await;
    assert_eq!(row.retries, 3);
    assert!(row.exception.unwrap().contains("connection refused"));

    let failed = failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, MessageKind::Published);
    assert_eq!(failed[0].message.retries, 3);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let inner = InMemoryBroker::new();
    let service = setup_with(Setup {
        transport: Some(Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
            inner: inner.clone(),
        })),
        ..Default::default()
    })
    .await;

    let id = service.publisher().publish("order.created", &1).await.unwrap();

    let s = &service;
    wait_until("message to recover", move || async move {
        s.message(MessageKind::Published, id).await.status == Status::Succeeded
    })
    .await;

    assert_eq!(service.message(MessageKind::Published, id).await.retries, 2);
    assert_eq!(inner.sent().len(), 1);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_transaction_rollback_and_commit() {
    let service = setup().await;
    let pool = service.storage().pool().clone();

    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY)")
        .execute(&pool)
        .await
        .unwrap();

    let mut tx = service.publisher().begin().await.unwrap();
    sqlx::query("INSERT INTO orders (id) VALUES (1)")
        .execute(&mut **tx.inner())
        .await
        .unwrap();
    let rolled_back = tx.publish("order.created", &json!({ "orderId": 1 })).await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = service.publisher().begin().await.unwrap();
    sqlx::query("INSERT INTO orders (id) VALUES (2)")
        .execute(&mut **tx.inner())
        .await
        .unwrap();
    let committed = tx.publish("order.created", &json!({ "orderId": 2 })).await.unwrap();
    tx.commit().await.unwrap();

    let orders: Vec<(i64,)> = sqlx::query_as("SELECT id FROM orders")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(orders, vec![(2,)]);

    assert!(service
        .storage()
        .get_message(MessageKind::Published, rolled_back)
        .await
        .unwrap()
        .is_none());

    let s = &service;
    wait_until("committed message to succeed", move || async move {
        s.message(MessageKind::Published, committed).await.status == Status::Succeeded
    })
    .await;
    assert_eq!(service.broker.sent().len(), 1);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_delayed_publish() {
    let service = setup().await;
    let delay = Duration::from_millis(400);

    let published_at = Utc::now();
    let id = service
        .publisher()
        .publish_delay(delay, "reminder", &"later", Default::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(service.broker.sent().is_empty());
    assert_ne!(service.message(MessageKind::Published, id).await.status, Status::Succeeded);

    let s = &service;
    wait_until("delayed message to be sent", move || async move {
        !s.broker.sent().is_empty()
    })
    .await;

    let elapsed = (Utc::now() - published_at).to_std().unwrap();
    assert!(elapsed >= delay);
    assert!(elapsed < delay + Duration::from_secs(3));

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_claim_race_between_nodes() {
    let tmpdir = tempfile::tempdir().unwrap();
    let config = config(&tmpdir);

    let a = SqliteStorage::connect(&config).await.unwrap();
    let b = SqliteStorage::connect(&config).await.unwrap();

    let broker = InMemoryBroker::new();
    let node = launch(config.clone(), &broker, None, SubscriberRegistry::default(), None).await;

    // With the node stopped nothing but the two storages competes for the row.
    let publisher = node.publisher().clone();
    node.shutdown().await;
    let id = publisher.publish("order.created", &1).await.unwrap();

    let now = Utc::now();
    let lease = now + chrono::Duration::minutes(5);
    let (first, second) = tokio::join!(a.claim_published(id, now, lease), b.claim_published(id, now, lease));

    let winners = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, Status::Processing);
}

#[tokio::test]
async fn test_two_nodes_deliver_once() {
    let tmpdir = tempfile::tempdir().unwrap();
    let config = config(&tmpdir);
    let broker = InMemoryBroker::new();

    let first = launch(config.clone(), &broker, None, SubscriberRegistry::default(), None).await;
    let second = launch(config, &broker, None, SubscriberRegistry::default(), None).await;

    let mut ids = HashSet::new();
    for n in 0..20 {
        ids.insert(first.publisher().publish("order.created", &n).await.unwrap());
    }

    let (f, b) = (&first, &broker);
    wait_until("every message to succeed", move || async move {
        b.sent().len() >= 20
            && f.storage()
                .statistics()
                .await
                .unwrap()
                .count(MessageKind::Published, Status::Succeeded)
                == 20
    })
    .await;

    // Both nodes keep sweeping; nothing goes out twice.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sent = broker
        .sent()
        .into_iter()
        .map(|m| m.headers[headers::MESSAGE_ID].parse::<MessageId>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(sent.len(), 20);
    assert_eq!(sent.into_iter().collect::<HashSet<_>>(), ids);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_groups_each_get_a_copy() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let registry = {
        let (g1, g2) = (handled.clone(), handled.clone());
        SubscriberRegistry::builder()
            .subscribe("x", Some("g1"), move |body: serde_json::Value, ctx| {
                g1.lock().unwrap().push((ctx.group, body));
                async { Ok(()) }
            })
            .subscribe("x", Some("g2"), move |body: serde_json::Value, ctx| {
                g2.lock().unwrap().push((ctx.group, body));
                async { Ok(()) }
            })
            .build()
    };
    let service = setup_with(Setup {
        registry,
        ..Default::default()
    })
    .await;

    service.publisher().publish("x", &json!({ "n": 1 })).await.unwrap();

    let s = &service;
    wait_until("both groups to handle the message", move || async move {
        let mut done = 0;
        for group in ["g1.v1", "g2.v1"] {
            let rows = s.received(group).await;
            done += rows.iter().filter(|r| r.status == Status::Succeeded).count();
        }
        done == 2
    })
    .await;

    let mut handled = handled.lock().unwrap().clone();
    handled.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        handled,
        vec![
            ("g1.v1".to_owned(), json!({ "n": 1 })),
            ("g2.v1".to_owned(), json!({ "n": 1 })),
        ]
    );
    assert_eq!(service.received("g1.v1").await.len(), 1);
    assert_eq!(service.received("g2.v1").await.len(), 1);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = {
        let attempts = attempts.clone();
        SubscriberRegistry::builder()
            .subscribe("invoice.due", Some("billing"), move |_: serde_json::Value, _| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        eyre::bail!("ledger locked");
                    }
                    Ok(())
                }
            })
            .build()
    };
    let service = setup_with(Setup {
        registry,
        ..Default::default()
    })
    .await;

    service.publisher().publish("invoice.due", &json!({})).await.unwrap();

    let s = &service;
    wait_until("handler to succeed on retry", move || async move {
        s.received("billing.v1")
            .await
            .first()
            .is_some_and(|r| r.status == Status::Succeeded)
    })
    .await;

    let row = &service.received("billing.v1").await[0];
    assert_eq!(row.retries, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_received_retry_budget_exhausted() {
    let tmpdir = tempfile::tempdir().unwrap();
    let failed = Arc::new(Mutex::new(Vec::new()));
    let registry = SubscriberRegistry::builder()
        .subscribe("invoice.due", Some("billing"), |_: serde_json::Value, _| async {
            Err::<(), _>(eyre::eyre!("ledger locked"))
        })
        .build();
    let service = setup_with(Setup {
        config: Some(Config {
            failed_retry_count: 2,
            ..config(&tmpdir)
        }),
        registry,
        failed: Some(failed.clone()),
        ..Default::default()
    })
    .await;

    service.publisher().publish("invoice.due", &json!({})).await.unwrap();

    let s = &service;
    wait_until("received message to fail", move || async move {
        s.received("billing.v1")
            .await
            .first()
            .is_some_and(|r| r.status == Status::Failed)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = &service.received("billing.v1").await[0];
    assert_eq!(row.retries, 2);
    assert!(row.exception.as_deref().unwrap().contains("ledger locked"));

    let failed = failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, MessageKind::Received);
    assert_eq!(failed[0].message.id, row.id);
    assert_eq!(failed[0].message.retries, 2);

    service.svc.shutdown().await;
}

#[tokio::test]
async fn test_blocked_group_does_not_stall_others() {
    let tmpdir = tempfile::tempdir().unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let registry = {
        let (handled, cancelled) = (handled.clone(), cancelled.clone());
        SubscriberRegistry::builder()
            .subscribe("x", Some("g1"), move |_: serde_json::Value, ctx| {
                let cancelled = cancelled.clone();
                async move {
                    ctx.cancellation.cancelled().await;
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .subscribe("x", Some("g2"), move |_: serde_json::Value, _| {
                handled.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build()
    };
    let service = setup_with(Setup {
        config: Some(Config {
            use_dispatching_per_group: true,
            subscriber_execute_thread_count: 1,
            ..config(&tmpdir)
        }),
        registry,
        ..Default::default()
    })
    .await;

    for n in 0..3 {
        service.publisher().publish("x", &json!({ "n": n })).await.unwrap();
    }

    let s = &service;
    wait_until("g2 to handle every message", move || async move {
        s.received("g2.v1")
            .await
            .iter()
            .filter(|r| r.status == Status::Succeeded)
            .count()
            == 3
    })
    .await;

    let g1 = service.received("g1.v1").await;
    assert!(g1.iter().all(|r| r.status != Status::Succeeded));
    assert_eq!(g1.iter().filter(|r| r.status == Status::Processing).count(), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 3);
    assert_eq!(cancelled.load(Ordering::SeqCst), 0);

    service.svc.shutdown().await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}
