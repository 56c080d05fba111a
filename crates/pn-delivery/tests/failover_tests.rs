//! End-to-end delivery manager behavior against scripted transports:
//! provider selection, one-hop failover, health exclusion, rate-limit
//! handling, bulk isolation and role switching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pn_common::{
    Address, BulkPayload, ChannelType, DeliveryEvent, DeliveryRequest, EventBus, PulseEvent,
    WebhookEvent,
};
use pn_delivery::{
    DeliveryError, DeliveryManager, Provider, ProviderTransport, TransportError, TransportReceipt,
};

/// Scripted outcome plan for a mock transport.
enum Plan {
    Always(bool),
    /// Outcomes consumed in order; succeeds once exhausted.
    Script(Vec<bool>),
    /// Outcomes repeated in a cycle.
    Cycle(Vec<bool>),
}

struct MockTransport {
    plan: Plan,
    calls: AtomicUsize,
}

impl MockTransport {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            plan: Plan::Always(true),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            plan: Plan::Always(false),
            calls: AtomicUsize::new(0),
        })
    }

    fn scripted(outcomes: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            plan: Plan::Script(outcomes),
            calls: AtomicUsize::new(0),
        })
    }

    fn cycling(pattern: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            plan: Plan::Cycle(pattern),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn send(
        &self,
        _address: &Address,
        _request: &DeliveryRequest,
    ) -> Result<TransportReceipt, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let ok = match &self.plan {
            Plan::Always(b) => *b,
            Plan::Script(v) => v.get(n).copied().unwrap_or(true),
            Plan::Cycle(v) => v[n % v.len()],
        };

        if ok {
            Ok(TransportReceipt {
                external_id: format!("mock-{}", n),
            })
        } else {
            Err(TransportError::Connection("simulated outage".to_string()))
        }
    }
}

fn email_request() -> DeliveryRequest {
    DeliveryRequest::new(
        Address::Email("patient@clinic.example".to_string()),
        "Your prescription is ready",
    )
}

fn manager_with(providers: Vec<Provider>) -> DeliveryManager {
    let manager = DeliveryManager::new(ChannelType::Email, EventBus::default());
    for provider in providers {
        manager.register(provider).unwrap();
    }
    manager
}

#[tokio::test]
async fn test_primary_preferred_when_healthy() {
    let primary = MockTransport::succeeding();
    let backup = MockTransport::succeeding();
    let manager = manager_with(vec![
        Provider::new("sendgrid", ChannelType::Email, 1, primary.clone()),
        Provider::new("ses", ChannelType::Email, 2, backup.clone()),
    ]);

    let (selected_primary, selected_backup) = manager.select_providers().unwrap();
    assert_eq!(selected_primary, "sendgrid");
    assert_eq!(selected_backup.as_deref(), Some("ses"));

    let result = manager.send(&email_request()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.provider_id, "sendgrid");
    assert!(!result.fallback_used);
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 0);
}

#[tokio::test]
async fn test_failover_single_hop_keeps_primary_healthy() {
    let primary = MockTransport::failing();
    let backup = MockTransport::succeeding();
    let manager = manager_with(vec![
        Provider::new("sendgrid", ChannelType::Email, 1, primary.clone()),
        Provider::new("ses", ChannelType::Email, 2, backup.clone()),
    ]);

    let result = manager.send(&email_request()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.provider_id, "ses");
    assert!(result.fallback_used);

    // A single failure is transient: the primary stays in rotation.
    let health = manager.get_health();
    let primary_health = health.iter().find(|h| h.provider_id == "sendgrid").unwrap();
    assert!(primary_health.healthy);
    assert_eq!(primary_health.consecutive_failures, 1);
}

#[tokio::test]
async fn test_both_providers_fail() {
    let manager = manager_with(vec![
        Provider::new("sendgrid", ChannelType::Email, 1, MockTransport::failing()),
        Provider::new("ses", ChannelType::Email, 2, MockTransport::failing()),
    ]);

    let err = manager.send(&email_request()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::DeliveryFailed(_)));
}

#[tokio::test]
async fn test_unhealthy_provider_excluded_from_selection() {
    let primary = MockTransport::failing();
    let backup = MockTransport::succeeding();
    let manager = manager_with(vec![
        Provider::new("sendgrid", ChannelType::Email, 1, primary.clone()),
        Provider::new("ses", ChannelType::Email, 2, backup.clone()),
    ]);

    // Three sends, three primary failures, each rescued by the backup.
    for _ in 0..3 {
        let result = manager.send(&email_request()).await.unwrap();
        assert!(result.fallback_used);
    }
    assert_eq!(primary.calls(), 3);

    let health = manager.get_health();
    let primary_health = health.iter().find(|h| h.provider_id == "sendgrid").unwrap();
    assert!(!primary_health.healthy);

    // The unhealthy primary no longer receives traffic.
    let (selected, fallback) = manager.select_providers().unwrap();
    assert_eq!(selected, "ses");
    assert_eq!(fallback, None);

    let result = manager.send(&email_request()).await.unwrap();
    assert_eq!(result.provider_id, "ses");
    assert!(!result.fallback_used);
    assert_eq!(primary.calls(), 3);
}

#[tokio::test]
async fn test_rate_limit_rejection_is_not_a_health_failure() {
    let transport = MockTransport::succeeding();
    let manager = manager_with(vec![Provider::new(
        "twilio",
        ChannelType::Email,
        1,
        transport.clone(),
    )
    .with_rate_limits(Some(1), None)]);

    let first = manager.send(&email_request()).await.unwrap();
    assert!(first.success);

    let err = manager.send(&email_request()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::RateLimitExceeded(ref p) if p == "twilio"));

    // The provider was never attempted for the rejected send and its health
    // record is untouched.
    assert_eq!(transport.calls(), 1);
    let health = manager.get_health();
    let record = health.iter().find(|h| h.provider_id == "twilio").unwrap();
    assert!(record.healthy);
    assert_eq!(record.consecutive_failures, 0);
}

#[tokio::test]
async fn test_rate_limited_primary_falls_over_to_backup() {
    let primary = MockTransport::succeeding();
    let backup = MockTransport::succeeding();
    let manager = manager_with(vec![
        Provider::new("sendgrid", ChannelType::Email, 1, primary.clone())
            .with_rate_limits(Some(1), None),
        Provider::new("ses", ChannelType::Email, 2, backup.clone()),
    ]);

    let first = manager.send(&email_request()).await.unwrap();
    assert_eq!(first.provider_id, "sendgrid");

    let second = manager.send(&email_request()).await.unwrap();
    assert_eq!(second.provider_id, "ses");
    assert!(second.fallback_used);
}

#[tokio::test]
async fn test_no_providers_registered() {
    let manager = DeliveryManager::new(ChannelType::Email, EventBus::default());
    let err = manager.send(&email_request()).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::ProviderUnavailable(ChannelType::Email)
    ));
}

#[tokio::test]
async fn test_invalid_recipient_rejected_before_selection() {
    let transport = MockTransport::succeeding();
    let manager = manager_with(vec![Provider::new(
        "sendgrid",
        ChannelType::Email,
        1,
        transport.clone(),
    )]);

    let request = DeliveryRequest::new(Address::Email("not-an-email".to_string()), "body");
    let err = manager.send(&request).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidRecipient(_)));
    assert_eq!(transport.calls(), 0);
}

#[test]
fn test_registration_rejects_duplicates_and_channel_mismatch() {
    let manager = DeliveryManager::new(ChannelType::Email, EventBus::default());
    manager
        .register(Provider::new(
            "sendgrid",
            ChannelType::Email,
            1,
            MockTransport::succeeding(),
        ))
        .unwrap();

    let duplicate = manager.register(Provider::new(
        "sendgrid",
        ChannelType::Email,
        2,
        MockTransport::succeeding(),
    ));
    assert!(matches!(duplicate, Err(DeliveryError::DuplicateProvider(_))));

    let mismatch = manager.register(Provider::new(
        "twilio",
        ChannelType::Sms,
        1,
        MockTransport::succeeding(),
    ));
    assert!(matches!(mismatch, Err(DeliveryError::ChannelMismatch { .. })));
}

#[tokio::test]
async fn test_bulk_partial_failure_is_isolated() {
    // Second target fails on both attempts (no backup registered); the other
    // two deliver.
    let transport = MockTransport::scripted(vec![true, false, true]);
    let manager = manager_with(vec![Provider::new(
        "sendgrid",
        ChannelType::Email,
        1,
        transport.clone(),
    )
    .with_cost(2)]);

    let targets = vec![
        Address::Email("a@clinic.example".to_string()),
        Address::Email("b@clinic.example".to_string()),
        Address::Email("c@clinic.example".to_string()),
    ];
    let payload = BulkPayload::new("Clinic closed Monday");

    let report = manager.send_bulk(&targets, &payload).await;
    assert_eq!(report.total, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total_cost_cents, 4);

    assert!(report.outcomes[0].success);
    assert!(!report.outcomes[1].success);
    assert!(report.outcomes[1].error.is_some());
    assert!(report.outcomes[2].success);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_batches_pause_between_batches() {
    let transport = MockTransport::succeeding();
    let manager = manager_with(vec![Provider::new(
        "sendgrid",
        ChannelType::Email,
        1,
        transport.clone(),
    )]);

    let targets: Vec<Address> = (0..120)
        .map(|i| Address::Email(format!("user{}@clinic.example", i)))
        .collect();
    let payload = BulkPayload::new("Maintenance window tonight");

    let started = tokio::time::Instant::now();
    let report = manager.send_bulk(&targets, &payload).await;

    assert_eq!(report.total, 120);
    assert_eq!(report.delivered, 120);
    assert_eq!(transport.calls(), 120);
    // 120 targets = 3 batches of 50, so two inter-batch pauses.
    assert_eq!(started.elapsed(), std::time::Duration::from_millis(400));
}

#[tokio::test]
async fn test_sustained_degradation_switches_primary() {
    // The primary fails two of every three sends but never crosses the
    // consecutive-failure threshold, so it stays healthy while the backup
    // quietly builds a perfect record through fallbacks.
    let flaky = MockTransport::cycling(vec![false, false, true]);
    let steady = MockTransport::succeeding();
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let manager = DeliveryManager::new(ChannelType::Email, bus);
    manager
        .register(Provider::new("sendgrid", ChannelType::Email, 1, flaky))
        .unwrap();
    manager
        .register(Provider::new("ses", ChannelType::Email, 2, steady))
        .unwrap();

    for _ in 0..30 {
        let result = manager.send(&email_request()).await.unwrap();
        assert!(result.success);
    }

    let mut switched = false;
    while let Ok(event) = events.try_recv() {
        if let PulseEvent::ProviderSwitch {
            from_provider,
            to_provider,
            ..
        } = event
        {
            assert_eq!(from_provider, "sendgrid");
            assert_eq!(to_provider, "ses");
            switched = true;
        }
    }
    assert!(switched, "expected a provider switch event");

    // After the switch the backup serves as primary.
    let (primary, _) = manager.select_providers().unwrap();
    assert_eq!(primary, "ses");
    let result = manager.send(&email_request()).await.unwrap();
    assert_eq!(result.provider_id, "ses");
    assert!(!result.fallback_used);
}

#[tokio::test]
async fn test_track_delivery_updates_stats_and_publishes() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let manager = DeliveryManager::new(ChannelType::Email, bus);
    manager
        .register(Provider::new(
            "sendgrid",
            ChannelType::Email,
            1,
            MockTransport::succeeding(),
        ))
        .unwrap();

    manager.track_delivery(WebhookEvent {
        provider_id: "sendgrid".to_string(),
        external_message_id: "ext-42".to_string(),
        event: DeliveryEvent::Delivered,
        timestamp: chrono::Utc::now(),
        recipient: Some("patient@clinic.example".to_string()),
    });

    let stats = manager.get_stats();
    let record = stats.iter().find(|s| s.provider_id == "sendgrid").unwrap();
    assert_eq!(record.delivered, 1);
    assert_eq!(manager.tracking_len(), 1);

    match events.recv().await.unwrap() {
        PulseEvent::DeliveryTracking {
            provider_id,
            external_message_id,
            event,
            ..
        } => {
            assert_eq!(provider_id, "sendgrid");
            assert_eq!(external_message_id, "ext-42");
            assert_eq!(event, DeliveryEvent::Delivered);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_tracking_records_expire_after_retention() {
    let manager = manager_with(vec![Provider::new(
        "sendgrid",
        ChannelType::Email,
        1,
        MockTransport::succeeding(),
    )]);

    manager.track_delivery(WebhookEvent {
        provider_id: "sendgrid".to_string(),
        external_message_id: "ext-old".to_string(),
        event: DeliveryEvent::Delivered,
        timestamp: chrono::Utc::now() - chrono::Duration::hours(25),
        recipient: None,
    });
    manager.track_delivery(WebhookEvent {
        provider_id: "sendgrid".to_string(),
        external_message_id: "ext-fresh".to_string(),
        event: DeliveryEvent::Delivered,
        timestamp: chrono::Utc::now(),
        recipient: None,
    });
    assert_eq!(manager.tracking_len(), 2);

    manager.start();
    // Past the first cleanup pass; only the record older than the
    // retention window goes.
    tokio::time::sleep(std::time::Duration::from_secs(601)).await;
    manager.shutdown();

    assert_eq!(manager.tracking_len(), 1);
}

#[tokio::test]
async fn test_cost_tracking_accumulates_per_provider() {
    let manager = manager_with(vec![Provider::new(
        "twilio",
        ChannelType::Email,
        1,
        MockTransport::succeeding(),
    )
    .with_cost(3)]);

    for _ in 0..4 {
        manager.send(&email_request()).await.unwrap();
    }

    let costs = manager.get_cost_tracking();
    let record = costs.iter().find(|c| c.provider_id == "twilio").unwrap();
    assert_eq!(record.messages_sent, 4);
    assert_eq!(record.total_cost_cents, 12);
}
