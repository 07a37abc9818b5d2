//! Bounded resource pool with create/validate/destroy hooks.
//!
//! - `acquire` hands out the oldest idle resource that still validates,
//!   creates one while below `max`, or waits on a [`Notify`] until something
//!   changes. Waiting never polls.
//! - A [`Lease`] returns its resource when released or dropped. Resources that
//!   fail validation on the way back are destroyed in the background and the
//!   pool is topped back up to `min`.
//! - A reaper destroys resources idle longer than `idle_timeout` while the pool
//!   is above `min`.
//! - `shutdown` refuses new acquisitions, waits for every lease to come back
//!   and destroys everything.
//!
//! `size` counts every live resource, including ones still being created or
//! destroyed, so `max` bounds real processes rather than idle slots.

use crate::error::{ProxyError, Result};
use crate::types::PoolStats;
use async_trait::async_trait;
use futures_util::future::join_all;
use shellproxy_core::Logger;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

/// Lifecycle hooks the pool calls for its resources.
#[async_trait]
pub trait ManageResource: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource>;

    /// Checked when an idle resource is handed out and when a lease returns.
    fn validate(&self, resource: &Self::Resource) -> bool;

    /// Best-effort teardown. Must not fail.
    async fn destroy(&self, resource: Self::Resource);
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

pub struct Pool<M: ManageResource> {
    shared: Arc<Shared<M>>,
}

struct Shared<M: ManageResource> {
    manager: M,
    options: PoolOptions,
    state: Mutex<PoolState<M::Resource>>,
    changed: Notify,
    reaper_stop: watch::Sender<bool>,
    logger: Logger,
}

struct PoolState<R> {
    idle: VecDeque<IdleEntry<R>>,
    size: usize,
    destroying: usize,
    borrowed: usize,
    waiting: usize,
    draining: bool,
}

struct IdleEntry<R> {
    resource: R,
    since: Instant,
}

impl<M: ManageResource> Pool<M> {
    /// Build the pool, create `min` resources up front and start the reaper.
    ///
    /// Initial create failures are logged; the reaper keeps trying to reach
    /// `min` afterwards.
    pub async fn new(manager: M, options: PoolOptions, logger: Logger) -> Self {
        let mut options = options;
        if options.max == 0 {
            logger.warn("max must be at least 1, using 1");
            options.max = 1;
        }
        if options.min > options.max {
            logger.warn(&format!("min {} exceeds max {}, using max", options.min, options.max));
            options.min = options.max;
        }

        let (reaper_stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            manager,
            options,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
                destroying: 0,
                borrowed: 0,
                waiting: 0,
                draining: false,
            }),
            changed: Notify::new(),
            reaper_stop,
            logger,
        });

        for _ in 0..options.min {
            shared.lock().size += 1;
            match shared.manager.create().await {
                Ok(resource) => shared.lock().idle.push_back(IdleEntry {
                    resource,
                    since: Instant::now(),
                }),
                Err(e) => {
                    shared.lock().size -= 1;
                    shared.logger.error(&format!("initial create failed: {e}"));
                    break;
                }
            }
        }

        spawn_reaper(&shared);
        Self { shared }
    }

    /// Borrow a resource, creating or waiting as needed.
    pub async fn acquire(&self) -> Result<Lease<M>> {
        let shared = &self.shared;
        loop {
            let notified = shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut st = shared.lock();
                if st.draining {
                    return Err(ProxyError::PoolDraining);
                }
                if let Some(entry) = st.idle.pop_front() {
                    st.borrowed += 1;
                    Step::Idle(entry.resource)
                } else if st.size < shared.options.max {
                    st.size += 1;
                    st.borrowed += 1;
                    Step::Create
                } else {
                    st.waiting += 1;
                    Step::Wait
                }
            };

            match step {
                Step::Idle(resource) => {
                    if shared.manager.validate(&resource) {
                        return Ok(Lease::new(resource, Arc::clone(shared)));
                    }
                    shared.logger.debug("idle resource failed validation, destroying");
                    {
                        let mut st = shared.lock();
                        st.borrowed -= 1;
                        st.destroying += 1;
                    }
                    shared.spawn_destroy(resource);
                }
                Step::Create => {
                    let slot = CreateSlot::new(&**shared);
                    let resource = shared.manager.create().await?;
                    slot.keep();
                    return Ok(Lease::new(resource, Arc::clone(shared)));
                }
                Step::Wait => {
                    let _waiting = WaitGuard(&**shared);
                    notified.await;
                }
            }
        }
    }

    /// Return a lease. Same as dropping it.
    pub fn release(&self, lease: Lease<M>) {
        drop(lease);
    }

    /// Stop handing out resources, wait for all leases to return, then
    /// destroy everything.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.lock().draining = true;
        let _ = shared.reaper_stop.send(true);
        shared.changed.notify_waiters();
        shared.logger.info("draining");

        loop {
            let notified = shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle: Vec<M::Resource> = {
                let mut st = shared.lock();
                if st.size == 0 {
                    break;
                }
                let idle: Vec<_> = st.idle.drain(..).map(|e| e.resource).collect();
                st.destroying += idle.len();
                idle
            };

            if idle.is_empty() {
                notified.await;
                continue;
            }
            join_all(idle.into_iter().map(|resource| shared.destroy_now(resource))).await;
        }
        shared.logger.info("drained");
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            size: st.size,
            idle: st.idle.len(),
            borrowed: st.borrowed,
            waiting: st.waiting,
            min: self.shared.options.min,
            max: self.shared.options.max,
            draining: st.draining,
        }
    }
}

enum Step<R> {
    Idle(R),
    Create,
    Wait,
}

impl<M: ManageResource> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Resource>> {
        self.state.lock().expect("pool state lock poisoned")
    }

    fn release(self: &Arc<Self>, resource: M::Resource) {
        let valid = self.manager.validate(&resource);
        let mut st = self.lock();
        st.borrowed -= 1;
        if valid && !st.draining {
            st.idle.push_back(IdleEntry {
                resource,
                since: Instant::now(),
            });
            drop(st);
            self.changed.notify_waiters();
        } else {
            st.destroying += 1;
            drop(st);
            if !valid {
                self.logger.info("released resource is invalid, destroying");
            }
            self.spawn_destroy(resource);
        }
    }

    /// Caller must already have counted the resource in `destroying`.
    fn spawn_destroy(self: &Arc<Self>, resource: M::Resource) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    shared.destroy_now(resource).await;
                    shared.ensure_min();
                });
            }
            Err(_) => {
                self.logger.warn("no runtime to destroy resource, dropping it");
                drop(resource);
                self.finish_destroy();
            }
        }
    }

    async fn destroy_now(&self, resource: M::Resource) {
        self.manager.destroy(resource).await;
        self.finish_destroy();
    }

    fn finish_destroy(&self) {
        {
            let mut st = self.lock();
            st.size -= 1;
            st.destroying -= 1;
        }
        self.changed.notify_waiters();
    }

    /// Start background creates until the pool holds `min` live resources.
    fn ensure_min(self: &Arc<Self>) {
        let deficit = {
            let mut st = self.lock();
            if st.draining {
                return;
            }
            let live = st.size - st.destroying;
            let deficit = self
                .options
                .min
                .saturating_sub(live)
                .min(self.options.max.saturating_sub(st.size));
            st.size += deficit;
            deficit
        };

        for _ in 0..deficit {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.manager.create().await {
                    Ok(resource) => {
                        let leftover = {
                            let mut st = shared.lock();
                            if st.draining {
                                st.destroying += 1;
                                Some(resource)
                            } else {
                                st.idle.push_back(IdleEntry {
                                    resource,
                                    since: Instant::now(),
                                });
                                None
                            }
                        };
                        if let Some(resource) = leftover {
                            shared.destroy_now(resource).await;
                            return;
                        }
                    }
                    Err(e) => {
                        shared.lock().size -= 1;
                        shared.logger.error(&format!("create failed: {e}"));
                    }
                }
                shared.changed.notify_waiters();
            });
        }
    }

    /// Remove idle resources past `idle_timeout` while above `min`.
    fn take_expired(&self) -> Vec<M::Resource> {
        let mut st = self.lock();
        let mut expired = Vec::new();
        let timeout = self.options.idle_timeout;
        while st.size - st.destroying > self.options.min {
            match st.idle.front() {
                Some(entry) if entry.since.elapsed() >= timeout => {}
                _ => break,
            }
            if let Some(entry) = st.idle.pop_front() {
                st.destroying += 1;
                expired.push(entry.resource);
            }
        }
        expired
    }
}

fn spawn_reaper<M: ManageResource>(shared: &Arc<Shared<M>>) {
    let weak: Weak<Shared<M>> = Arc::downgrade(shared);
    let mut stop = shared.reaper_stop.subscribe();
    let period = shared.options.reap_interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let expired = shared.take_expired();
            if !expired.is_empty() {
                shared
                    .logger
                    .debug(&format!("reaping {} idle resource(s)", expired.len()));
            }
            for resource in expired {
                shared.destroy_now(resource).await;
            }
            shared.ensure_min();
        }
    });
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// A borrowed resource. Dropping it returns the resource to the pool.
pub struct Lease<M: ManageResource> {
    resource: Option<M::Resource>,
    shared: Arc<Shared<M>>,
}

impl<M: ManageResource> Lease<M> {
    fn new(resource: M::Resource, shared: Arc<Shared<M>>) -> Self {
        Self {
            resource: Some(resource),
            shared,
        }
    }
}

impl<M: ManageResource> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("lease already returned")
    }
}

impl<M: ManageResource> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.release(resource);
        }
    }
}

/// Gives back a reserved create slot unless the create succeeded.
struct CreateSlot<'a, M: ManageResource> {
    shared: &'a Shared<M>,
    armed: bool,
}

impl<'a, M: ManageResource> CreateSlot<'a, M> {
    fn new(shared: &'a Shared<M>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<M: ManageResource> Drop for CreateSlot<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut st = self.shared.lock();
                st.size -= 1;
                st.borrowed -= 1;
            }
            self.shared.changed.notify_waiters();
        }
    }
}

struct WaitGuard<'a, M: ManageResource>(&'a Shared<M>);

impl<M: ManageResource> Drop for WaitGuard<'_, M> {
    fn drop(&mut self) {
        self.0.lock().waiting -= 1;
    }
}
