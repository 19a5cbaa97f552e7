//! End-to-end dispatcher runs against Postgres.
//! Set DATABASE_TEST_URL (or OUTBOX_TEST_DOCKER=1) or these tests are skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outbox_dispatch::{Dispatcher, HandlerRegistry};
use outbox_store::testutil::{test_database, TestDatabase};
use outbox_store::{EventStatus, NewEvent, OutboxConfig, OutboxEvent, OutboxStore};
use serde_json::json;
use uuid::Uuid;

fn fast_store(db: &TestDatabase) -> OutboxStore {
    db.store_with(
        OutboxConfig::builder()
            .base_retry_delay(Duration::from_millis(10))
            .max_retry_delay(Duration::from_secs(1))
            .idle_timeout(Duration::from_millis(100))
            .error_backoff(Duration::from_millis(50))
            .build(),
    )
}

async fn enqueue(store: &OutboxStore, event: NewEvent) -> Uuid {
    let mut tx = store.begin().await.unwrap();
    let id = tx.enqueue(event).await.unwrap();
    tx.commit().await.unwrap();
    id
}

async fn wait_for_status(store: &OutboxStore, id: Uuid, status: EventStatus) -> OutboxEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let event = store.read_event(id).await.unwrap().unwrap();
        if event.status == status {
            return event;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "event {id} stuck in {} waiting for {status}",
            event.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn order_is_written_and_its_event_delivered() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = fast_store(&db);
    sqlx::query("CREATE TABLE orders (id SERIAL PRIMARY KEY, amount INT NOT NULL)")
        .execute(&db.pool)
        .await
        .unwrap();

    let notified = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new().on("order.created", {
        let notified = notified.clone();
        move |event: OutboxEvent, ctx| {
            let notified = notified.clone();
            async move {
                assert_eq!(event.payload["amount"], 100);
                ctx.run_once(async {
                    notified.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                })
                .await?;
                anyhow::Ok(())
            }
        }
    });
    let handle = Dispatcher::postgres(store.clone(), registry).start().unwrap();

    let event_id = store
        .with_transaction(|tx| {
            Box::pin(async move {
                let (order_id,): (i32,) =
                    sqlx::query_as("INSERT INTO orders (amount) VALUES (100) RETURNING id")
                        .fetch_one(tx.conn())
                        .await?;
                let id = tx
                    .enqueue(NewEvent::new(
                        "order.created",
                        json!({"order_id": order_id, "amount": 100}),
                    ))
                    .await?;
                Ok::<_, anyhow::Error>(id)
            })
        })
        .await
        .unwrap();

    let event = wait_for_status(&store, event_id, EventStatus::Sent).await;
    let stats = handle.stop().await.unwrap();

    assert!(event.processed_at.is_some());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(store.idempotency().exists(&event_id.to_string()).await.unwrap());
    assert_eq!(stats.sent, 1);
}

#[tokio::test]
async fn listener_wakes_an_idle_dispatcher() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = db.store_with(
        OutboxConfig::builder()
            .idle_timeout(Duration::from_secs(60))
            .build(),
    );
    let registry = HandlerRegistry::new().on("order.created", |_, _| async { Ok(()) });
    let handle = Dispatcher::postgres(store.clone(), registry).start().unwrap();

    // Let the dispatcher subscribe and go idle.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let id = enqueue(&store, NewEvent::new("order.created", json!({}))).await;

    let started = tokio::time::Instant::now();
    wait_for_status(&store, id, EventStatus::Sent).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = fast_store(&db);
    let attempts = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new().on("order.created", {
        let attempts = attempts.clone();
        move |_, _| {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("downstream returned 503");
                }
                Ok(())
            }
        }
    });
    let handle = Dispatcher::postgres(store.clone(), registry).start().unwrap();
    let id = enqueue(&store, NewEvent::new("order.created", json!({}))).await;

    let event = wait_for_status(&store, id, EventStatus::Sent).await;
    let stats = handle.stop().await.unwrap();

    assert_eq!(event.retry_count, 2);
    assert_eq!(event.last_error.as_deref(), Some("downstream returned 503"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.retried, 2);
}

#[tokio::test]
async fn side_effect_that_panics_is_not_repeated_on_redelivery() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = fast_store(&db);
    let effects = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new().on("order.created", {
        let effects = effects.clone();
        move |_, ctx| {
            let effects = effects.clone();
            async move {
                let first_attempt = ctx.attempt() == 1;
                ctx.run_once(async {
                    effects.fetch_add(1, Ordering::SeqCst);
                    if first_attempt {
                        panic!("webhook client crashed after sending");
                    }
                    anyhow::Ok(())
                })
                .await?;
                anyhow::Ok(())
            }
        }
    });
    let handle = Dispatcher::postgres(store.clone(), registry).start().unwrap();
    let id = enqueue(&store, NewEvent::new("order.created", json!({}))).await;

    let event = wait_for_status(&store, id, EventStatus::Sent).await;
    handle.stop().await.unwrap();

    assert_eq!(event.retry_count, 1);
    assert_eq!(effects.load(Ordering::SeqCst), 1);
    assert!(store.idempotency().exists(&id.to_string()).await.unwrap());
}

#[tokio::test]
async fn unhandled_type_ends_failed() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = fast_store(&db);
    let registry = HandlerRegistry::new().on("order.created", |_, _| async { Ok(()) });
    let handle = Dispatcher::postgres(store.clone(), registry).start().unwrap();

    let id = enqueue(
        &store,
        NewEvent::new("order.refunded", json!({})).with_max_retries(2),
    )
    .await;

    let event = wait_for_status(&store, id, EventStatus::Failed).await;
    handle.stop().await.unwrap();

    assert_eq!(event.retry_count, 3);
    assert!(event.processed_at.is_none());
    assert!(event
        .last_error
        .unwrap()
        .contains("no handler registered for event type `order.refunded`"));
    assert_eq!(store.count_by_status().await.unwrap().failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_dispatchers_deliver_each_event_exactly_once() {
    let Some(db) = test_database().await else {
        return;
    };
    let store = fast_store(&db);
    let seen: Arc<Mutex<HashMap<Uuid, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    let registry = HandlerRegistry::new().on("order.created", {
        let seen = seen.clone();
        move |event: OutboxEvent, _| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap().entry(event.id).or_default() += 1;
                Ok(())
            }
        }
    });

    let a = Dispatcher::postgres(store.clone(), registry.clone())
        .with_name("a")
        .start()
        .unwrap();
    let b = Dispatcher::postgres(store.clone(), registry)
        .with_name("b")
        .start()
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    let mut ids = Vec::new();
    for n in 0..100 {
        ids.push(
            tx.enqueue(NewEvent::new("order.created", json!({ "n": n })))
                .await
                .unwrap(),
        );
    }
    tx.commit().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while store.count_by_status().await.unwrap().sent < 100 {
        assert!(tokio::time::Instant::now() < deadline, "dispatchers stalled");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let stats_a = a.stop().await.unwrap();
    let stats_b = b.stop().await.unwrap();

    let seen = seen.lock().unwrap();
    for id in &ids {
        assert_eq!(seen.get(id), Some(&1), "event {id} not delivered exactly once");
    }
    assert_eq!(stats_a.sent + stats_b.sent, 100);
}
