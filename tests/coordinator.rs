mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use uuid::Uuid;

use common::{policy, Harness, START};
use warden::ratelimit::{
    AdaptiveBounds, AdmissionRequest, Algorithm, BaseAlgorithm, ChannelSink, CoordinatorSettings,
    CounterState, LoadFeedback, PolicySnapshot, PolicySpec, RateKey, Scope,
};

fn alice() -> AdmissionRequest {
    AdmissionRequest::new()
        .user("alice")
        .ip("10.0.0.1".parse().unwrap())
        .endpoint("/orders")
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[tokio::test]
async fn test_no_policy_admits_unbounded() {
    let harness = Harness::new(vec![]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    let verdict = coordinator.admit(&alice(), None).await;
    assert!(verdict.allowed);
    assert!(!verdict.degraded);
    assert_eq!(verdict.policy_id, None);
    assert_eq!(coordinator.metrics().unbounded, 1);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_fixed_window_limit_and_reset() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 5)]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    for expected_remaining in (0..5).rev() {
        let verdict = coordinator.admit(&alice(), None).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, expected_remaining);
        assert_eq!(verdict.limit, Some(5));
    }

    harness.clock.advance(ms(700));
    let denied = coordinator.admit(&alice(), None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(ms(300)));
    assert_eq!(denied.reset_at, START + Duration::from_secs(1));
    assert_eq!(denied.policy_id.as_deref(), Some("per-user"));

    harness.clock.set(START + Duration::from_secs(1));
    let verdict = coordinator.admit(&alice(), None).await;
    assert!(verdict.allowed);
    assert_eq!(verdict.remaining, 4);
}

#[tokio::test]
async fn test_sliding_window_ages_out_events() {
    let harness = Harness::new(vec![policy("sliding", Scope::User, Algorithm::SlidingWindow, 5)]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    for at in [100, 300, 500, 700, 900] {
        let verdict = coordinator.admit(&alice(), Some(START + ms(at))).await;
        assert!(verdict.allowed, "check at {at}ms");
    }

    let denied = coordinator.admit(&alice(), Some(START + ms(1050))).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(ms(50)));

    let verdict = coordinator.admit(&alice(), Some(START + ms(1100))).await;
    assert!(verdict.allowed);
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let bucket = Algorithm::TokenBucket {
        burst_capacity: 10,
        refill_rate: 2.0,
    };
    let harness = Harness::new(vec![policy("bucket", Scope::Ip, bucket, 2)]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    for _ in 0..10 {
        assert!(coordinator.admit(&alice(), None).await.allowed);
    }
    let denied = coordinator.admit(&alice(), None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(ms(500)));

    harness.clock.advance(ms(500));
    assert!(coordinator.admit(&alice(), None).await.allowed);
    assert!(!coordinator.admit(&alice(), None).await.allowed);
}

#[tokio::test]
async fn test_narrower_scope_with_lower_priority_number_wins() {
    let per_user = PolicySpec::new("per-user", Scope::User, Algorithm::FixedWindow, 100)
        .priority(10)
        .build()
        .unwrap();
    let per_resource = PolicySpec::new("per-resource", Scope::Resource, Algorithm::FixedWindow, 1)
        .priority(1)
        .build()
        .unwrap();
    let harness = Harness::new(vec![per_user, per_resource]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    let request = alice().resource("order-42");
    let verdict = coordinator.admit(&request, None).await;
    assert_eq!(verdict.policy_id.as_deref(), Some("per-resource"));
    assert!(!coordinator.admit(&request, None).await.allowed);

    // Without a resource only the user policy matches.
    let verdict = coordinator.admit(&alice(), None).await;
    assert_eq!(verdict.policy_id.as_deref(), Some("per-user"));
    assert!(verdict.allowed);
}

#[tokio::test]
async fn test_equal_priority_prefers_narrower_scope() {
    let per_ip = policy("per-ip", Scope::Ip, Algorithm::FixedWindow, 10);
    let per_endpoint = policy("per-endpoint", Scope::Endpoint, Algorithm::FixedWindow, 10);
    let harness = Harness::new(vec![per_ip, per_endpoint]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    let limits = coordinator.limits(&alice(), None).await.unwrap();
    assert_eq!(limits.policy.id(), "per-endpoint");
    assert_eq!(limits.rate_key, RateKey::new(Scope::Endpoint, "/orders"));
}

#[tokio::test]
async fn test_denial_emits_violation_event() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 2)]).await;
    let (sink, mut events) = ChannelSink::new(16);
    let settings = CoordinatorSettings {
        instance_id: Uuid::new_v4(),
        ..CoordinatorSettings::default()
    };
    let instance_id = settings.instance_id;
    let coordinator = harness.coordinator(settings).with_violation_sink(Arc::new(sink));

    coordinator.admit(&alice(), None).await;
    coordinator.admit(&alice(), None).await;
    let denied = coordinator.admit(&alice(), None).await;
    assert!(!denied.allowed);

    let event = events.next().await.unwrap();
    assert_eq!(event.rate_key, RateKey::new(Scope::User, "alice"));
    assert_eq!(event.policy_id, "per-user");
    assert_eq!(event.timestamp, START);
    assert_eq!(event.observed_count, 3);
    assert_eq!(event.limit, 2);
    assert_eq!(event.instance_id, instance_id);
}

#[tokio::test]
async fn test_full_violation_channel_does_not_affect_verdict() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 1)]).await;
    let (sink, _events) = ChannelSink::new(1);
    let coordinator = harness
        .coordinator(CoordinatorSettings::default())
        .with_violation_sink(Arc::new(sink));

    assert!(coordinator.admit(&alice(), None).await.allowed);
    assert!(!coordinator.admit(&alice(), None).await.allowed);
    let dropped = coordinator.admit(&alice(), None).await;
    assert!(!dropped.allowed);
    assert!(!dropped.degraded);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.denied, 2);
    assert_eq!(metrics.violations_dropped, 1);
}

#[tokio::test]
async fn test_adaptive_limit_follows_load() {
    let adaptive = Algorithm::Adaptive {
        inner: BaseAlgorithm::FixedWindow,
        bounds: AdaptiveBounds { min: 10, max: 100 },
        adjustment_interval_ms: 1000,
    };
    let harness = Harness::new(vec![policy("adaptive", Scope::User, adaptive, 100)]).await;
    let load = Arc::new(LoadFeedback::default());
    let coordinator = harness
        .coordinator(CoordinatorSettings::default())
        .with_load_signal(load.clone());

    load.report(0.5);
    for _ in 0..50 {
        assert!(coordinator.admit(&alice(), None).await.allowed);
    }
    let denied = coordinator.admit(&alice(), None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.limit, Some(50));

    // Load drops within the adjustment interval; the limit holds.
    load.report(0.0);
    harness.clock.advance(ms(500));
    let still_denied = coordinator.admit(&alice(), None).await;
    assert!(!still_denied.allowed);
    assert_eq!(still_denied.limit, Some(50));

    harness.clock.set(START + Duration::from_secs(1));
    let verdict = coordinator.admit(&alice(), None).await;
    assert!(verdict.allowed);
    assert_eq!(verdict.limit, Some(100));
    assert_eq!(verdict.remaining, 99);
}

#[tokio::test]
async fn test_projections_do_not_mutate() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 5)]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    let status = coordinator.status(&alice(), None).await.unwrap().unwrap();
    assert_eq!(status.state, None);
    assert_eq!(status.usage.used, 0);
    assert_eq!(status.usage.remaining, 5);

    for _ in 0..3 {
        coordinator.admit(&alice(), None).await;
    }

    for _ in 0..3 {
        let usage = coordinator.usage(&alice(), None).await.unwrap().unwrap();
        assert_eq!(usage.policy_id, "per-user");
        assert_eq!(usage.usage.used, 3);
        assert_eq!(usage.usage.remaining, 2);
    }

    let status = coordinator.status(&alice(), None).await.unwrap().unwrap();
    assert!(matches!(status.state, Some(CounterState::FixedWindow(ref s)) if s.count == 3));

    let verdict = coordinator.admit(&alice(), None).await;
    assert_eq!(verdict.remaining, 1);

    let anonymous = AdmissionRequest::new().endpoint("/health");
    assert!(coordinator.usage(&anonymous, None).await.unwrap().is_none());
    assert!(coordinator.limits(&anonymous, None).await.is_none());
}

#[tokio::test]
async fn test_algorithm_change_starts_fresh_state() {
    let harness = Harness::new(vec![policy("p", Scope::User, Algorithm::FixedWindow, 1)]).await;
    let coordinator = harness.coordinator(CoordinatorSettings::default());

    assert!(coordinator.admit(&alice(), None).await.allowed);
    assert!(!coordinator.admit(&alice(), None).await.allowed);

    let bucket = Algorithm::TokenBucket {
        burst_capacity: 3,
        refill_rate: 1.0,
    };
    harness
        .source
        .replace(PolicySnapshot::new(vec![policy("p", Scope::User, bucket, 1)]).unwrap());
    coordinator.policies().invalidate();

    let verdict = coordinator.admit(&alice(), None).await;
    assert!(verdict.allowed);
    assert_eq!(verdict.remaining, 2);
}

#[tokio::test]
async fn test_sweeper_removes_expired_state() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 5)]).await;
    let coordinator = Arc::new(harness.coordinator(CoordinatorSettings::default()));

    coordinator.admit(&alice(), None).await;
    coordinator.admit(&AdmissionRequest::new().user("bob"), None).await;
    assert_eq!(harness.store.len(), 2);

    harness.clock.advance(Duration::from_secs(2));
    let sweeper = coordinator.spawn_sweeper(ms(5));
    for _ in 0..100 {
        if harness.store.is_empty() {
            break;
        }
        tokio::time::sleep(ms(5)).await;
    }
    sweeper.abort();
    assert!(harness.store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_checks_never_over_admit() {
    let harness = Harness::new(vec![policy("per-user", Scope::User, Algorithm::FixedWindow, 10)]).await;
    let coordinator = Arc::new(harness.coordinator(CoordinatorSettings {
        check_timeout: Duration::from_secs(5),
        ..CoordinatorSettings::default()
    }));

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.admit(&alice(), Some(START)).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        let verdict = handle.await.unwrap();
        assert!(!verdict.degraded);
        if verdict.allowed {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 10);
    let metrics = coordinator.metrics();
    assert_eq!(metrics.allowed, 10);
    assert_eq!(metrics.denied, 990);
}
