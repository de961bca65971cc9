// tests/leasing.rs
mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{at, drain, event_names, setup_db};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;

use schedflow::events::{EventBus, SchedulerEvent};
use schedflow::schedules::{LeaseManager, NewScheduledJob, UpdateState};
use schedflow::store::{MemoryStore, PgStore, Store};
use schedflow::strategies::lease_id::UuidLeaseId;
use schedflow::SchedError;

fn t0() -> DateTime<Utc> {
    at("2030-01-01T00:00:00Z")
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(n)
}

async fn seeded(store: &dyn Store, id: &str) {
    store
        .insert_schedule(id, &NewScheduledJob::after_run("lease-test", 60), t0())
        .await
        .unwrap();
}

fn manager(store: Arc<dyn Store>, grace_secs: i64, events: EventBus) -> LeaseManager {
    LeaseManager::new(
        store,
        Arc::new(UuidLeaseId),
        Duration::seconds(grace_secs),
        events,
    )
}

#[tokio::test]
async fn only_one_holder_at_a_time() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.acquire_at("s-1", "b", 30, secs(10)).await.unwrap());
    // the holder cannot stack a second acquisition either
    assert!(!leases.acquire_at("s-1", "a", 30, secs(10)).await.unwrap());

    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_owner.as_deref(), Some("a"));
    assert_eq!(s.lease_expires, Some(secs(30)));
}

#[tokio::test]
async fn unknown_schedule_cannot_be_leased() {
    let store = MemoryStore::new();
    let leases = manager(Arc::new(store), 0, EventBus::new());
    assert!(!leases.acquire_at("missing", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.release("missing", "a").await.unwrap());
}

#[tokio::test]
async fn unusable_lease_lengths_are_rejected() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    for bad in [0, -5, i64::MAX] {
        let err = leases.acquire_at("s-1", "a", bad, secs(0)).await.unwrap_err();
        assert!(
            matches!(err, SchedError::InvalidLeaseDuration { seconds } if seconds == bad),
            "{err}"
        );
    }
    // nothing was written
    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_owner, None);

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    let err = leases
        .renew_at("s-1", "a", i64::MAX, secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidLeaseDuration { .. }), "{err}");
    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_expires, Some(secs(30)));
}

#[tokio::test]
async fn release_only_by_owner() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.release("s-1", "b").await.unwrap());
    assert!(leases.release("s-1", "a").await.unwrap());
    assert!(!leases.release("s-1", "a").await.unwrap());

    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_owner, None);
    assert_eq!(s.lease_expires, None);

    assert!(leases.acquire_at("s-1", "b", 30, secs(1)).await.unwrap());
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.acquire_at("s-1", "b", 30, secs(29)).await.unwrap());
    // expiry is inclusive
    assert!(leases.acquire_at("s-1", "b", 30, secs(30)).await.unwrap());

    // the old holder's release is a no-op now
    assert!(!leases.release("s-1", "a").await.unwrap());
    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_owner.as_deref(), Some("b"));
}

#[tokio::test]
async fn grace_extends_the_lease() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 5, EventBus::new());

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.acquire_at("s-1", "b", 30, secs(31)).await.unwrap());
    assert!(!leases.acquire_at("s-1", "b", 30, secs(34)).await.unwrap());
    assert!(leases.acquire_at("s-1", "b", 30, secs(35)).await.unwrap());
}

#[tokio::test]
async fn renew_requires_a_live_lease_held_by_the_caller() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    assert!(leases.acquire_at("s-1", "a", 30, secs(0)).await.unwrap());
    assert!(!leases.renew_at("s-1", "b", 30, secs(10)).await.unwrap());
    assert!(leases.renew_at("s-1", "a", 30, secs(20)).await.unwrap());

    let s = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s.lease_expires, Some(secs(50)));

    // too late: the lease ran out before the renewal
    assert!(!leases.renew_at("s-1", "a", 30, secs(50)).await.unwrap());
}

#[tokio::test]
async fn with_lease_releases_on_success_and_error() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    let out = leases
        .with_lease("s-1", 30, secs(0), |owner| {
            let store = store.clone();
            async move {
                let s = store.get_schedule("s-1").await?.unwrap();
                assert_eq!(s.lease_owner.as_deref(), Some(owner.as_str()));
                Ok::<_, SchedError>(41 + 1)
            }
        })
        .await
        .unwrap();
    assert_eq!(out, Some(42));
    assert_eq!(store.get_schedule("s-1").await.unwrap().unwrap().lease_owner, None);

    let err = leases
        .with_lease("s-1", 30, secs(1), |_owner| async move {
            Err::<(), _>(SchedError::Execution("boom".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::Execution(_)));
    assert_eq!(store.get_schedule("s-1").await.unwrap().unwrap().lease_owner, None);
}

#[tokio::test]
async fn with_lease_skips_when_busy() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    let leases = manager(Arc::new(store.clone()), 0, EventBus::new());

    assert!(leases.acquire_at("s-1", "other", 30, secs(0)).await.unwrap());

    let mut ran = false;
    let out = leases
        .with_lease("s-1", 30, secs(5), |_owner| {
            ran = true;
            async { Ok::<(), SchedError>(()) }
        })
        .await
        .unwrap();

    assert!(out.is_none());
    assert!(!ran);
    assert_eq!(
        store.get_schedule("s-1").await.unwrap().unwrap().lease_owner.as_deref(),
        Some("other")
    );
}

#[tokio::test]
async fn sweep_announces_and_repairs_abandoned_updates() {
    let store = MemoryStore::new();
    seeded(&store, "s-1").await;
    seeded(&store, "s-2").await;
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let leases = manager(Arc::new(store.clone()), 0, events);

    // s-1: a worker died mid task creation
    assert!(leases.acquire_at("s-1", "crashed", 30, secs(0)).await.unwrap());
    assert!(store
        .set_update_state("s-1", "crashed", Some(UpdateState::CreatingTask), Some("t-77"))
        .await
        .unwrap());
    // s-2: still healthy
    assert!(leases.acquire_at("s-2", "alive", 300, secs(0)).await.unwrap());

    assert!(leases.sweep_expired(secs(29), 10).await.unwrap().is_empty());

    let expired = leases.sweep_expired(secs(30), 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, "s-1");

    let events = drain(&mut rx);
    assert_eq!(event_names(&events), vec!["scheduledJobLeaseExpired"]);
    match &events[0] {
        SchedulerEvent::ScheduledJobLeaseExpired {
            schedule_id,
            lease_owner,
            lease_expires,
            update_state,
            update_task_pk,
        } => {
            assert_eq!(schedule_id, "s-1");
            assert_eq!(lease_owner.as_deref(), Some("crashed"));
            assert_eq!(*lease_expires, Some(secs(30)));
            assert_eq!(*update_state, Some(UpdateState::CreatingTask));
            assert_eq!(update_task_pk.as_deref(), Some("t-77"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let s1 = store.get_schedule("s-1").await.unwrap().unwrap();
    assert_eq!(s1.lease_owner, None);
    assert_eq!(s1.update_state, None);
    assert_eq!(s1.update_task_pk, None);

    let s2 = store.get_schedule("s-2").await.unwrap().unwrap();
    assert_eq!(s2.lease_owner.as_deref(), Some("alive"));

    // repaired rows are not reported again
    assert!(leases.sweep_expired(secs(31), 10).await.unwrap().is_empty());
}

/// Random interleaving of acquire/renew/release/time steps against a
/// reference model: at every step at most one live holder exists and it is
/// the one the model predicts.
#[tokio::test]
async fn random_operations_keep_a_single_live_holder() {
    const OWNERS: [&str; 3] = ["a", "b", "c"];

    for seed in 0..20u64 {
        let store = MemoryStore::new();
        seeded(&store, "s-1").await;
        let leases = manager(Arc::new(store.clone()), 2, EventBus::new());
        let grace = Duration::seconds(2);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut now = t0();
        // (owner, expires) as the model sees it
        let mut model: Option<(&str, DateTime<Utc>)> = None;

        for _ in 0..200 {
            let owner = OWNERS[rng.gen_range(0..OWNERS.len())];
            let live = model.filter(|(_, exp)| *exp + grace > now);

            match rng.gen_range(0..4) {
                0 => {
                    let ok = leases.acquire_at("s-1", owner, 10, now).await.unwrap();
                    assert_eq!(ok, live.is_none(), "seed {seed}: acquire by {owner}");
                    if ok {
                        model = Some((owner, now + Duration::seconds(10)));
                    }
                }
                1 => {
                    let ok = leases.renew_at("s-1", owner, 10, now).await.unwrap();
                    let expect = live.is_some_and(|(o, _)| o == owner);
                    assert_eq!(ok, expect, "seed {seed}: renew by {owner}");
                    if ok {
                        model = Some((owner, now + Duration::seconds(10)));
                    }
                }
                2 => {
                    let ok = leases.release("s-1", owner).await.unwrap();
                    let expect = model.is_some_and(|(o, _)| o == owner);
                    assert_eq!(ok, expect, "seed {seed}: release by {owner}");
                    if ok {
                        model = None;
                    }
                }
                _ => now += Duration::seconds(rng.gen_range(1..8)),
            }

            let s = store.get_schedule("s-1").await.unwrap().unwrap();
            assert_eq!(
                s.lease_owner.as_deref(),
                model.map(|(o, _)| o),
                "seed {seed}: stored holder diverged"
            );
            let holders = OWNERS
                .iter()
                .filter(|o| s.lease_owner.as_deref() == Some(**o) && s.is_locked(now, grace))
                .count();
            assert!(holders <= 1);
        }
    }
}

#[tokio::test]
#[serial] // shares the test database
async fn pg_concurrent_acquire_has_one_winner() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store = PgStore::new(pool.clone());
    let now = Utc::now();
    store
        .insert_schedule("s-race", &NewScheduledJob::after_run("race", 60), now)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let owner = format!("worker-{i}");
            let ok = store
                .try_acquire_lease(
                    "s-race",
                    &owner,
                    now,
                    now + Duration::seconds(30),
                    Duration::zero(),
                )
                .await
                .unwrap();
            ok.then_some(owner)
        }));
    }

    let mut winners = HashSet::new();
    for h in handles {
        if let Some(owner) = h.await.unwrap() {
            winners.insert(owner);
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let s = store.get_schedule("s-race").await.unwrap().unwrap();
    let winner = winners.into_iter().next().unwrap();
    assert_eq!(s.lease_owner.as_deref(), Some(winner.as_str()));

    // expired (with grace) -> somebody else can take it
    let later = now + Duration::seconds(31);
    assert!(!store
        .try_acquire_lease("s-race", "late", later, later + Duration::seconds(30), Duration::seconds(5))
        .await
        .unwrap());
    assert!(store
        .try_acquire_lease("s-race", "late", later, later + Duration::seconds(30), Duration::zero())
        .await
        .unwrap());
    assert!(!store.release_lease("s-race", &winner).await.unwrap());
    assert!(store.release_lease("s-race", "late").await.unwrap());
}

#[tokio::test]
#[serial]
async fn pg_sweep_repairs_expired_lease() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let leases = manager(store.clone(), 0, events);
    let now = Utc::now();

    seeded(store.as_ref(), "s-crash").await;
    assert!(leases.acquire_at("s-crash", "crashed", 10, now).await.unwrap());
    assert!(store
        .set_update_state("s-crash", "crashed", Some(UpdateState::ExecutingTask), Some("t-1"))
        .await
        .unwrap());

    let later = now + Duration::seconds(11);
    let expired = leases.sweep_expired(later, 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].update_state, Some(UpdateState::ExecutingTask));
    assert_eq!(event_names(&drain(&mut rx)), vec!["scheduledJobLeaseExpired"]);

    let s = store.get_schedule("s-crash").await.unwrap().unwrap();
    assert_eq!(s.lease_owner, None);
    assert_eq!(s.update_state, None);
}
