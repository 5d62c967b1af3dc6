//! Randomized operation sequences checked against the structural invariants
//! of every resource.

#[allow(dead_code)]
mod common;

use common::{extent, namespace, request, RecordingAst};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use strata_delm::{
    DelmError, EnqueueFlags, EnqueueOutcome, LockHandle, LockMode, Resource, ResourceId,
};

const PAGE: u64 = 4096;

fn check_all(resources: &[Arc<Resource>], step: usize) {
    for res in resources {
        if let Err(e) = res.check_invariants() {
            panic!("step {}: resource {}: {}", step, res.id(), e);
        }
        for lock in res.snapshot().granted {
            assert!(
                lock.extent.contains(&lock.req_extent),
                "step {}: {} granted {} for {}",
                step,
                lock.id,
                lock.extent,
                lock.req_extent
            );
        }
    }
}

async fn run_random_ops(seed: u64, ops: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let ns = namespace();
    let resources: Vec<_> = (0..3)
        .map(|oid| ns.resource_get(ResourceId::new(9, oid)))
        .collect();
    let ast = RecordingAst::new();
    let mut handles: Vec<LockHandle> = Vec::new();

    for step in 0..ops {
        let res = &resources[rng.gen_range(0..resources.len())];
        match rng.gen_range(0..10) {
            0..=5 => {
                let mode = LockMode::ALL[rng.gen_range(0..LockMode::ALL.len())];
                let offset = if rng.gen_bool(0.5) { rng.gen_range(0..PAGE) } else { 0 };
                let start = rng.gen_range(0..64u64) * PAGE + offset;
                let len = if rng.gen_bool(0.4) {
                    rng.gen_range(1..PAGE)
                } else {
                    rng.gen_range(1..16u64) * PAGE
                };
                let end = start + len - 1;
                let want = extent(start, end);

                let mut req = request(rng.gen_range(1..5), mode, start, end, &ast);
                if mode == LockMode::Group {
                    req = req.with_gid(rng.gen_range(1..3));
                }
                if rng.gen_bool(0.3) {
                    req = req.with_flags(EnqueueFlags::LOCK_NO_EXPAND);
                }
                if rng.gen_bool(0.2) {
                    req = req.with_flags(EnqueueFlags::NONBLOCK);
                }

                match ns.enqueue(res, req).await {
                    Ok(EnqueueOutcome::Granted(grant)) => {
                        assert!(grant.extent.contains(&want));
                        handles.push(grant.lock);
                    }
                    Ok(EnqueueOutcome::Waiting(waiter)) => handles.push(waiter.lock.clone()),
                    Ok(other) => panic!("step {}: unexpected outcome {:?}", step, other),
                    Err(DelmError::WouldBlock) => {}
                    Err(e) => panic!("step {}: enqueue failed: {}", step, e),
                }
            }
            6..=8 if !handles.is_empty() => {
                let lock = handles.swap_remove(rng.gen_range(0..handles.len()));
                ns.cancel(&lock).await;
            }
            _ if !handles.is_empty() => {
                let lock = &handles[rng.gen_range(0..handles.len())];
                // Already cancelled locks report a stale handle.
                let _ = ns.ast_completed(lock).await;
            }
            _ => {}
        }
        check_all(&resources, step);
    }

    for lock in handles {
        ns.cancel(&lock).await;
    }
    check_all(&resources, ops);
    for res in &resources {
        let snap = res.snapshot();
        assert!(snap.granted.is_empty() && snap.waiting.is_empty());
    }
    assert_eq!(ns.stats().live_locks, 0);
}

#[tokio::test]
async fn test_random_operations_keep_invariants() {
    for seed in [1, 7, 42, 0x5eed] {
        run_random_ops(seed, 800).await;
    }
}

#[tokio::test]
async fn test_cancel_after_enqueue_restores_state() {
    let ns = namespace();
    let res = ns.resource_get(ResourceId::new(9, 100));
    let ast = RecordingAst::new();

    for (export, mode, start) in [
        (1, LockMode::Pw, 0),
        (2, LockMode::Pr, 8 * PAGE),
        (3, LockMode::Cw, 16 * PAGE),
    ] {
        ns.enqueue(
            &res,
            request(export, mode, start, start + PAGE - 1, &ast)
                .with_flags(EnqueueFlags::LOCK_NO_EXPAND),
        )
        .await
        .unwrap()
        .into_grant()
        .unwrap();
    }
    let before = res.snapshot();

    let grant = ns
        .enqueue(&res, request(4, LockMode::Pr, 9 * PAGE, 10 * PAGE - 1, &ast))
        .await
        .unwrap()
        .into_grant()
        .unwrap();
    assert_eq!(grant.extent, extent(PAGE, 16 * PAGE - 1));
    ns.cancel(&grant.lock).await;

    let after = res.snapshot();
    assert_eq!(after.granted, before.granted);
    assert_eq!(after.waiting, before.waiting);
    assert_eq!(after.kms, before.kms);
    assert_eq!(ast.blocking_count(), 0);
}
