//! Reading, confirming and removing subscriptions end to end.

use std::sync::Arc;
use std::time::Duration;

use provisioning_rust::queue::names::{
    DISPATCH_STREAM, INCOMING_STREAM, INCOMING_SUBJECT, PREFILL_QUEUE_STREAM,
};
use provisioning_rust::{
    DeliveryError, MessageProcessingStatus, MessageQueue, NewSubscription, PrefillMode,
    Registration, ServiceError,
};

use crate::support::{created, users, wait_until, Harness};

const WAIT: Duration = Duration::from_millis(100);

#[tokio::test]
async fn peek_returns_the_head_until_confirmed() {
    let harness = Harness::with_mode(Arc::new(users(&["uid=a", "uid=b"])), PrefillMode::Spawn).await;
    let provisioning = &harness.provisioning;
    provisioning
        .subscriptions()
        .register(NewSubscription::new("crm", true).with_realm_topic("udm", "users/.*"))
        .await
        .unwrap();
    let messages = provisioning.messages();
    wait_until("first prefill message", || async move {
        messages.get_next_message("crm", WAIT, false).await.unwrap().is_some()
    })
    .await;

    let first = messages.get_next_message("crm", WAIT, false).await.unwrap().unwrap();
    let again = messages.get_next_message("crm", WAIT, false).await.unwrap().unwrap();
    assert_eq!(first.sequence_number, again.sequence_number);
    assert_eq!(first.event.event_id(), again.event.event_id());

    // Without pop a batch holds only the head.
    let batch = messages.get_messages("crm", WAIT, false, 5).await.unwrap();
    assert_eq!(batch.len(), 1);

    messages
        .update_message_status("crm", first.sequence_number, MessageProcessingStatus::Ok)
        .await
        .unwrap();
    let second = messages.get_next_message("crm", WAIT, false).await.unwrap().unwrap();
    assert_ne!(second.sequence_number, first.sequence_number);
    messages
        .update_message_status("crm", second.sequence_number, MessageProcessingStatus::Ok)
        .await
        .unwrap();
    assert!(messages.get_next_message("crm", WAIT, false).await.unwrap().is_none());
    assert!(messages.prefill_consumed("crm"));
}

#[tokio::test]
async fn confirming_live_messages() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let provisioning = &harness.provisioning;
    provisioning
        .subscriptions()
        .register(NewSubscription::new("crm", false).with_realm_topic("udm", ".*"))
        .await
        .unwrap();
    let dispatcher = provisioning.spawn_dispatcher();
    provisioning
        .ingestor()
        .ingest(created("users/user", "uid=a"))
        .await
        .unwrap();

    let messages = provisioning.messages();
    let message = messages
        .get_next_message("crm", Duration::from_secs(2), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.num_delivered, 1);
    messages
        .update_message_status("crm", message.sequence_number, MessageProcessingStatus::Ok)
        .await
        .unwrap();
    assert!(harness.broker.messages(DISPATCH_STREAM, "crm.main").is_empty());

    let unknown = messages
        .update_message_status("crm", message.sequence_number, MessageProcessingStatus::Ok)
        .await
        .unwrap_err();
    assert_eq!(ServiceError::from(unknown).status_code(), 404);
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn delete_removes_queues_and_record() {
    let harness = Harness::with_mode(Arc::new(users(&["uid=a"])), PrefillMode::Spawn).await;
    let provisioning = &harness.provisioning;
    let subscriptions = provisioning.subscriptions();
    subscriptions
        .register(NewSubscription::new("crm", true).with_realm_topic("udm", "users/user"))
        .await
        .unwrap();
    let broker = harness.broker.clone();
    wait_until("prefill written", || {
        let broker = broker.clone();
        async move { broker.messages(PREFILL_QUEUE_STREAM, "crm.prefill").len() == 1 }
    })
    .await;

    subscriptions.delete("crm").await.unwrap();
    assert!(harness.broker.messages(PREFILL_QUEUE_STREAM, "crm.prefill").is_empty());
    assert!(matches!(subscriptions.get("crm").await, Err(ServiceError::NotFound(_))));
    assert!(matches!(subscriptions.delete("crm").await, Err(ServiceError::NotFound(_))));
    assert!(matches!(
        provisioning.messages().get_next_message("crm", WAIT, true).await,
        Err(DeliveryError::SubscriptionNotFound(_))
    ));
}

#[tokio::test]
async fn reused_name_starts_with_an_empty_queue() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let provisioning = &harness.provisioning;
    let subscriptions = provisioning.subscriptions();
    subscriptions
        .register(NewSubscription::new("crm", false).with_realm_topic("udm", "users/user"))
        .await
        .unwrap();
    subscriptions.delete("crm").await.unwrap();

    // A fan-out that still used the old mapping lands after the delete.
    provisioning
        .ingestor()
        .ingest(created("users/user", "uid=old"))
        .await
        .unwrap();
    let stale = harness.broker.messages(INCOMING_STREAM, INCOMING_SUBJECT).remove(0);
    harness
        .broker
        .ensure_stream(DISPATCH_STREAM, true, Some(vec!["crm.main".to_string()]))
        .await
        .unwrap();
    harness
        .broker
        .add_message(DISPATCH_STREAM, "crm.main", stale.payload)
        .await
        .unwrap();

    let registration = subscriptions
        .register(NewSubscription::new("crm", false).with_realm_topic("udm", "groups/.*"))
        .await
        .unwrap();
    assert!(matches!(registration, Registration::Created(_)));
    assert!(harness.broker.messages(DISPATCH_STREAM, "crm.main").is_empty());
    assert!(provisioning
        .messages()
        .get_next_message("crm", WAIT, true)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn registration_is_idempotent_but_not_overwriting() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let subscriptions = harness.provisioning.subscriptions();
    let crm = || {
        NewSubscription::new("crm", false)
            .with_realm_topic("udm", "users/user")
            .with_realm_topic("udm", "groups/group")
    };

    assert!(matches!(subscriptions.register(crm()).await.unwrap(), Registration::Created(_)));
    assert!(matches!(
        subscriptions.register(crm()).await.unwrap(),
        Registration::AlreadyExists(_)
    ));

    let widened = crm().with_realm_topic("udm", ".*");
    let err = subscriptions.register(widened).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    let invalid = NewSubscription::new("crm.v2", false).with_realm_topic("udm", ".*");
    assert_eq!(subscriptions.register(invalid).await.unwrap_err().status_code(), 400);

    let listed = subscriptions.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].realm_topics.len(), 2);
}
