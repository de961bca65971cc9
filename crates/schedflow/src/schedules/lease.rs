//! Schedule-level leases.
//!
//! A lease is an owner tag plus an expiry written onto the schedule row with a
//! single conditional update. Holding it is what entitles a worker to mutate
//! the schedule and its non-terminal tasks. There is no other lock.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedError};
use crate::events::{EventBus, SchedulerEvent};
use crate::schedules::model::ScheduledJob;
use crate::store::Store;
use crate::strategies::LeaseIdStrategy;
use crate::time;

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    lease_ids: Arc<dyn LeaseIdStrategy>,
    grace: Duration,
    events: EventBus,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn Store>,
        lease_ids: Arc<dyn LeaseIdStrategy>,
        grace: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            lease_ids,
            grace,
            events,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn new_lease_owner_id(&self) -> String {
        self.lease_ids.create()
    }

    pub async fn acquire(&self, schedule_id: &str, owner: &str, lease_seconds: i64) -> Result<bool> {
        self.acquire_at(schedule_id, owner, lease_seconds, time::now_utc())
            .await
    }

    pub async fn acquire_at(
        &self,
        schedule_id: &str,
        owner: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expires = lease_expiry(now, lease_seconds)?;
        let ok = self
            .store
            .try_acquire_lease(schedule_id, owner, now, expires, self.grace)
            .await?;

        debug!(schedule_id = %schedule_id, owner = %owner, acquired = ok, "lease acquire");
        Ok(ok)
    }

    pub async fn renew(&self, schedule_id: &str, owner: &str, lease_seconds: i64) -> Result<bool> {
        self.renew_at(schedule_id, owner, lease_seconds, time::now_utc())
            .await
    }

    pub async fn renew_at(
        &self,
        schedule_id: &str,
        owner: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expires = lease_expiry(now, lease_seconds)?;
        self.store
            .renew_lease(schedule_id, owner, now, expires, self.grace)
            .await
    }

    pub async fn release(&self, schedule_id: &str, owner: &str) -> Result<bool> {
        let ok = self.store.release_lease(schedule_id, owner).await?;
        if !ok {
            // lost to expiry and re-acquisition; nothing of ours to clear
            debug!(schedule_id = %schedule_id, owner = %owner, "lease release skipped: not owner");
        }
        Ok(ok)
    }

    /// Run `f` while holding a fresh lease on `schedule_id`.
    ///
    /// `Ok(None)` when someone else holds the lease. The lease is released
    /// whether `f` succeeds or fails.
    pub async fn with_lease<T, F, Fut>(
        &self,
        schedule_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let owner = self.new_lease_owner_id();
        if !self
            .acquire_at(schedule_id, &owner, lease_seconds, now)
            .await?
        {
            return Ok(None);
        }

        let out = f(owner.clone()).await;
        let released = self.release(schedule_id, &owner).await;

        let value = out?;
        released?;
        Ok(Some(value))
    }

    /// Find schedules whose lease ran out, announce them, and clear any
    /// in-flight marker they were left with.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let expired = self
            .store
            .poll_expired_leases(now, self.grace, limit)
            .await?;

        for schedule in &expired {
            warn!(
                schedule_id = %schedule.id,
                lease_owner = ?schedule.lease_owner,
                lease_expires = ?schedule.lease_expires,
                update_state = ?schedule.update_state,
                "schedule lease expired"
            );

            self.events.publish(SchedulerEvent::ScheduledJobLeaseExpired {
                schedule_id: schedule.id.clone(),
                lease_owner: schedule.lease_owner.clone(),
                lease_expires: schedule.lease_expires,
                update_state: schedule.update_state,
                update_task_pk: schedule.update_task_pk.clone(),
            });

            self.repair(schedule, now).await?;
        }

        Ok(expired)
    }

    async fn repair(&self, schedule: &ScheduledJob, now: DateTime<Utc>) -> Result<()> {
        let owner = self.new_lease_owner_id();
        // short lease: only long enough to clear the marker
        if !self.acquire_at(&schedule.id, &owner, 30, now).await? {
            return Ok(());
        }

        let res = match schedule.update_state {
            Some(state) => {
                info!(
                    schedule_id = %schedule.id,
                    update_state = %state,
                    update_task_pk = ?schedule.update_task_pk,
                    "clearing abandoned update"
                );
                self.store
                    .set_update_state(&schedule.id, &owner, None, None)
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };

        self.release(&schedule.id, &owner).await?;
        res
    }
}

fn lease_expiry(now: DateTime<Utc>, lease_seconds: i64) -> Result<DateTime<Utc>> {
    if !(1..=time::MAX_OFFSET_SECONDS).contains(&lease_seconds) {
        return Err(SchedError::InvalidLeaseDuration {
            seconds: lease_seconds,
        });
    }
    time::add_seconds(now, lease_seconds).ok_or(SchedError::InvalidLeaseDuration {
        seconds: lease_seconds,
    })
}
