// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use fabstir_rag_engine::config::RateLimitConfig;
use fabstir_rag_engine::rate_limit::Admission;
use fabstir_rag_engine::{OperationKind, RateLimiter};
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const OPERATIONS: [OperationKind; 4] = [
    OperationKind::Chat,
    OperationKind::Ingest,
    OperationKind::Query,
    OperationKind::Execute,
];

fn limiter(window_secs: u64, max_requests: u32) -> RateLimiter {
    RateLimiter::new(&RateLimitConfig {
        enabled: true,
        window_secs,
        max_requests,
        operations: HashMap::new(),
    })
}

#[test]
fn test_admissions_never_exceed_quota_within_a_window() {
    let mut rng = thread_rng();

    for _ in 0..200 {
        let max_requests = rng.gen_range(1..=40u32);
        let calls = rng.gen_range(0..=120u32);
        let op = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
        let limiter = limiter(60, max_requests);
        let start = Instant::now();

        // Sorted offsets that all land inside the first window
        let mut offsets: Vec<u64> = (0..calls).map(|_| rng.gen_range(0..59_000)).collect();
        offsets.sort_unstable();

        let mut admitted = 0;
        let mut denied = 0;
        for offset in offsets {
            match limiter.admit_at("user", op, start + Duration::from_millis(offset)) {
                Admission::Allowed { .. } => admitted += 1,
                Admission::Denied { retry_after } => {
                    assert!(retry_after <= Duration::from_secs(60));
                    denied += 1;
                }
            }
        }

        assert!(admitted <= max_requests);
        assert_eq!(admitted, calls.min(max_requests));
        if calls > max_requests {
            assert!(denied >= 1);
        }
    }
}

#[test]
fn test_quota_is_per_identity_and_operation() {
    let limiter = limiter(60, 3);
    let now = Instant::now();

    for _ in 0..3 {
        assert!(limiter.admit_at("alice", OperationKind::Chat, now).is_allowed());
    }
    assert!(!limiter.admit_at("alice", OperationKind::Chat, now).is_allowed());

    assert!(limiter.admit_at("bob", OperationKind::Chat, now).is_allowed());
    assert!(limiter.admit_at("alice", OperationKind::Query, now).is_allowed());
}

#[test]
fn test_new_window_admits_again() {
    let limiter = limiter(10, 2);
    let start = Instant::now();

    assert!(limiter.admit_at("u", OperationKind::Ingest, start).is_allowed());
    assert!(limiter.admit_at("u", OperationKind::Ingest, start).is_allowed());
    assert_eq!(
        limiter.admit_at("u", OperationKind::Ingest, start + Duration::from_secs(4)),
        Admission::Denied {
            retry_after: Duration::from_secs(6)
        }
    );
    assert!(limiter
        .admit_at("u", OperationKind::Ingest, start + Duration::from_secs(10))
        .is_allowed());
}
