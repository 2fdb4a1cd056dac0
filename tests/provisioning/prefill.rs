//! Prefill through the request queue and through spawned tasks.

use std::sync::Arc;
use std::time::Duration;

use provisioning_rust::queue::names::{
    DISPATCH_STREAM, PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT,
};
use provisioning_rust::{
    InMemoryBroker, NewSubscription, PrefillError, PrefillMode, PrefillStatus, PublisherName,
    QueueError, Registration, WorkerError, WorkerHandle,
};

use crate::support::{
    created, users, wait_until, FailingSource, FlakyQueue, GatedSource, Harness,
};

const WAIT: Duration = Duration::from_millis(100);

async fn wait_for_status(harness: &Harness, name: &str, status: PrefillStatus) {
    let subscriptions = harness.provisioning.subscriptions();
    wait_until(&format!("{name} to reach {status}"), || async move {
        subscriptions.get(name).await.unwrap().prefill_status == status
    })
    .await;
}

async fn wait_for_failure_records(harness: &Harness, count: usize) {
    let broker = harness.broker.clone();
    wait_until(&format!("{count} recorded prefill failures"), || {
        let broker = broker.clone();
        async move {
            broker
                .messages(PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT)
                .len()
                == count
        }
    })
    .await;
}

async fn harness_without_prefill_writes(mode: PrefillMode) -> Harness {
    let broker = InMemoryBroker::new();
    let queue = FlakyQueue::new(broker.clone()).failing_prefill_writes();
    Harness::with_queue(Arc::new(queue), broker, Arc::new(users(&["uid=a"])), mode).await
}

fn crm() -> NewSubscription {
    NewSubscription::new("crm", true).with_realm_topic("udm", "users/user")
}

#[tokio::test]
async fn prefill_is_delivered_before_live_events() {
    let source = Arc::new(GatedSource::new(users(&["uid=a", "uid=b", "uid=c"])));
    let harness = Harness::new(source.clone()).await;
    let provisioning = &harness.provisioning;
    provisioning.subscriptions().register(crm()).await.unwrap();
    let dispatcher = provisioning.spawn_dispatcher();
    let worker = provisioning.spawn_prefill_worker();

    wait_for_status(&harness, "crm", PrefillStatus::Running).await;
    provisioning
        .ingestor()
        .ingest(created("users/user", "uid=live"))
        .await
        .unwrap();
    let broker = harness.broker.clone();
    wait_until("live event dispatched", || {
        let broker = broker.clone();
        async move { broker.messages(DISPATCH_STREAM, "crm.main").len() == 1 }
    })
    .await;

    // Live events are held back while the prefill runs.
    let messages = provisioning.messages();
    assert!(messages.get_next_message("crm", WAIT, false).await.unwrap().is_none());

    source.open();
    wait_for_status(&harness, "crm", PrefillStatus::Done).await;

    let delivered = messages.get_messages("crm", WAIT, true, 10).await.unwrap();
    let dns: Vec<&str> = delivered
        .iter()
        .map(|m| m.event.body().new_object().unwrap()["dn"].as_str().unwrap())
        .collect();
    assert_eq!(dns, ["uid=a", "uid=b", "uid=c", "uid=live"]);
    assert!(delivered[..3]
        .iter()
        .all(|m| m.event.publisher_name() == PublisherName::UdmPreFill));
    assert_eq!(delivered[3].event.publisher_name(), PublisherName::UdmListener);
    assert!(messages.prefill_consumed("crm"));

    let stats = worker.stop().await.unwrap();
    assert_eq!(stats.completed, 1);
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn spawned_prefill_needs_no_worker() {
    let harness = Harness::with_mode(Arc::new(users(&["uid=a", "uid=b"])), PrefillMode::Spawn).await;
    harness.provisioning.subscriptions().register(crm()).await.unwrap();

    wait_for_status(&harness, "crm", PrefillStatus::Done).await;
    let delivered = harness
        .provisioning
        .messages()
        .get_messages("crm", WAIT, true, 10)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 2);
}

#[tokio::test]
async fn subscriptions_without_prefill_start_on_the_live_queue() {
    let harness = Harness::new(Arc::new(users(&["uid=a"]))).await;
    let registration = harness
        .provisioning
        .subscriptions()
        .register(NewSubscription::new("crm", false).with_realm_topic("udm", "users/user"))
        .await
        .unwrap();
    assert_eq!(registration.subscription().prefill_status, PrefillStatus::Done);
    let dispatcher = harness.provisioning.spawn_dispatcher();

    harness
        .provisioning
        .ingestor()
        .ingest(created("users/user", "uid=live"))
        .await
        .unwrap();
    let message = harness
        .provisioning
        .messages()
        .get_next_message("crm", Duration::from_secs(2), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.event.publisher_name(), PublisherName::UdmListener);
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn failed_prefill_is_recorded_and_not_retried() {
    let harness = Harness::new(Arc::new(FailingSource)).await;
    let provisioning = &harness.provisioning;
    provisioning.subscriptions().register(crm()).await.unwrap();
    let worker = provisioning.spawn_prefill_worker();

    wait_for_status(&harness, "crm", PrefillStatus::Failed).await;
    let broker = harness.broker.clone();
    wait_until("failure recorded", || {
        let broker = broker.clone();
        async move {
            broker
                .messages(PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT)
                .len()
                == 1
        }
    })
    .await;
    assert!(provisioning
        .messages()
        .get_next_message("crm", WAIT, false)
        .await
        .unwrap()
        .is_none());

    // Same settings again: nothing changes, no new prefill.
    let again = provisioning.subscriptions().register(crm()).await.unwrap();
    assert!(matches!(again, Registration::AlreadyExists(ref s) if s.prefill_status == PrefillStatus::Failed));

    // Re-registering after a delete starts over.
    provisioning.subscriptions().delete("crm").await.unwrap();
    provisioning.subscriptions().register(crm()).await.unwrap();
    wait_until("second failure recorded", || {
        let broker = broker.clone();
        async move {
            broker
                .messages(PREFILL_FAILURES_STREAM, PREFILL_FAILURES_SUBJECT)
                .len()
                == 2
        }
    })
    .await;

    let stats = worker.stop().await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn broker_loss_fails_a_spawned_prefill() {
    let harness = harness_without_prefill_writes(PrefillMode::Spawn).await;
    harness.provisioning.subscriptions().register(crm()).await.unwrap();

    wait_for_status(&harness, "crm", PrefillStatus::Failed).await;
    wait_for_failure_records(&harness, 1).await;
}

#[tokio::test]
async fn prefill_interrupted_too_often_is_abandoned() {
    let harness = harness_without_prefill_writes(PrefillMode::Queue).await;
    let provisioning = &harness.provisioning;
    provisioning.subscriptions().register(crm()).await.unwrap();
    let spawn_worker = || {
        let worker = provisioning.prefill_worker().with_max_attempts(1);
        WorkerHandle::spawn("prefill-worker", move |cancel| async move {
            worker.run(cancel).await
        })
    };

    // The broker fails mid-fill: the request goes back and the worker stops.
    let first = spawn_worker();
    tokio::time::timeout(Duration::from_secs(5), first.finished())
        .await
        .expect("worker kept running after losing the broker");
    assert!(matches!(
        first.join().await,
        Err(WorkerError::Failed {
            error: PrefillError::Queue(QueueError::ReconnectExhausted { .. }),
            ..
        })
    ));
    let status = provisioning.subscriptions().get("crm").await.unwrap().prefill_status;
    assert_eq!(status, PrefillStatus::Running);

    // The redelivery is over the limit and is not run again.
    let second = spawn_worker();
    wait_for_status(&harness, "crm", PrefillStatus::Failed).await;
    wait_for_failure_records(&harness, 1).await;
    let stats = second.stop().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
}
