//! Per-position leases and repeating take tasks.
//!
//! A lease gives one attempt exclusive use of a position for a bounded
//! time. Each lease carries a token; only the holder of the matching token
//! can release it, and an expiry timer clears it after its TTL so a crashed
//! attempt never blocks the position for long.
//!
//! Repeating tasks run a [`LeaseJob`] on a fixed interval, taking the
//! lease around every run.

use crate::error::LeaseError;
use crate::position::Position;
use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Proof of lease ownership.
pub type LeaseToken = u64;

/// What a repeating task does after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Work performed while holding a position's lease.
#[async_trait]
pub trait LeaseJob: Send + Sync + 'static {
    async fn run(&self, position: &Position) -> TaskControl;
}

struct Lease {
    token: LeaseToken,
    expires_at: Instant,
    timer: AbortHandle,
}

struct TaskEntry {
    generation: u64,
    handle: AbortHandle,
}

/// Owns every lease and repeating task. Shared via `Arc`.
pub struct LeaseScheduler {
    leases: DashMap<Address, Lease>,
    tasks: DashMap<Address, TaskEntry>,
    next_token: AtomicU64,
    ttl: Duration,
    task_interval: Duration,
}

impl std::fmt::Debug for LeaseScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseScheduler")
            .field("leases", &self.leases.len())
            .field("tasks", &self.tasks.len())
            .field("ttl", &self.ttl)
            .field("task_interval", &self.task_interval)
            .finish()
    }
}

impl LeaseScheduler {
    pub fn new(ttl: Duration, task_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            leases: DashMap::new(),
            tasks: DashMap::new(),
            next_token: AtomicU64::new(1),
            ttl,
            task_interval,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lease on `id` for `ttl`. Fails while an unexpired lease exists.
    pub fn acquire(self: &Arc<Self>, id: Address, ttl: Duration) -> Result<LeaseToken, LeaseError> {
        let now = Instant::now();
        match self.leases.entry(id) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return Err(LeaseError::LockOccupied(id));
                }
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let stale = held.insert(self.new_lease(id, token, now, ttl));
                stale.timer.abort();
                trace!(token = %id, lease = token, "Lease taken over after expiry");
                Ok(token)
            }
            Entry::Vacant(slot) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                slot.insert(self.new_lease(id, token, now, ttl));
                trace!(token = %id, lease = token, "Lease acquired");
                Ok(token)
            }
        }
    }

    /// Release `id` if `token` still owns it.
    pub fn release(&self, id: Address, token: LeaseToken) -> bool {
        match self.leases.remove_if(&id, |_, lease| lease.token == token) {
            Some((_, lease)) => {
                lease.timer.abort();
                trace!(token = %id, lease = token, "Lease released");
                true
            }
            None => false,
        }
    }

    /// Whether `id` currently has an unexpired lease.
    pub fn is_leased(&self, id: &Address) -> bool {
        self.leases
            .get(id)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Number of running repeating tasks.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn has_task(&self, id: &Address) -> bool {
        self.tasks.contains_key(id)
    }

    /// Spawn the repeating task for `position` unless one is already running.
    pub fn start_if_absent(self: &Arc<Self>, position: Position, job: Arc<dyn LeaseJob>) -> bool {
        let id = position.token;
        match self.tasks.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let generation = self.next_token.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(run_task(
                    Arc::downgrade(self),
                    position,
                    job,
                    generation,
                    self.ttl,
                    self.task_interval,
                ));
                slot.insert(TaskEntry {
                    generation,
                    handle: handle.abort_handle(),
                });
                info!(token = %id, "Repeating take task started");
                true
            }
        }
    }

    /// Abort the task for `id` and clear any lease.
    pub fn stop(&self, id: &Address) {
        if let Some((_, task)) = self.tasks.remove(id) {
            task.handle.abort();
            info!(token = %id, "Repeating take task stopped");
        }
        if let Some((_, lease)) = self.leases.remove(id) {
            lease.timer.abort();
        }
    }

    fn new_lease(self: &Arc<Self>, id: Address, token: LeaseToken, now: Instant, ttl: Duration) -> Lease {
        let scheduler = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(scheduler) = scheduler.upgrade() {
                if scheduler.leases.remove_if(&id, |_, lease| lease.token == token).is_some() {
                    debug!(token = %id, lease = token, "Lease expired");
                }
            }
        });
        Lease {
            token,
            expires_at: now + ttl,
            timer: timer.abort_handle(),
        }
    }

    fn finish_task(&self, id: &Address, generation: u64) {
        if self.tasks.remove_if(id, |_, task| task.generation == generation).is_some() {
            info!(token = %id, "Repeating take task finished");
        }
    }
}

impl Drop for LeaseScheduler {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.handle.abort();
        }
        for lease in self.leases.iter() {
            lease.timer.abort();
        }
    }
}

async fn run_task(
    scheduler: Weak<LeaseScheduler>,
    position: Position,
    job: Arc<dyn LeaseJob>,
    generation: u64,
    ttl: Duration,
    every: Duration,
) {
    let id = position.token;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(owner) = scheduler.upgrade() else {
            return;
        };

        let token = match owner.acquire(id, ttl) {
            Ok(token) => token,
            Err(LeaseError::LockOccupied(_)) => {
                trace!(token = %id, "Lease held elsewhere, skipping tick");
                continue;
            }
        };
        drop(owner);

        let control = job.run(&position).await;

        let Some(owner) = scheduler.upgrade() else {
            return;
        };
        owner.release(id, token);
        if control == TaskControl::Stop {
            owner.finish_task(&id, generation);
            return;
        }
    }
}
