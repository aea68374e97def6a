//! Tier scheduling
//!
//! Every device runs one task per polling tier. A task reads its tier's
//! batches in plan order, decodes them into the value store, runs the
//! derivation evaluator and broadcasts the result. Ticks that fire while a
//! pass is still running are skipped, never queued.

use metrics::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::decode::decode_member;
use crate::derive::Evaluator;
use crate::error::{ConfigError, TransportError};
use crate::planner::{self, Batch, BatchPlan, PlannerSettings};
use crate::register::{PollTier, RegisterDescriptor};
use crate::store::{RegisterUpdate, SharedStore, ValueStore};
use crate::transport::Transport;

/// Transport of one device; `None` once the device has been drained.
pub type SharedTransport = Arc<Mutex<Option<Box<dyn Transport>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub fast: Duration,
    pub normal: Duration,
    pub slow: Duration,
    /// Timeout passed to every transport call.
    pub timeout: Duration,
    /// Consecutive failed batches before the device's tiers back off. Zero
    /// disables backoff.
    pub failure_threshold: u32,
    pub max_backoff: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(1),
            normal: Duration::from_secs(5),
            slow: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self, tier: PollTier) -> Duration {
        match tier {
            PollTier::Fast => self.fast,
            PollTier::Normal => self.normal,
            PollTier::Slow => self.slow,
        }
    }

    /// Reject settings the tier tasks cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("fast_ms", self.fast),
            ("normal_ms", self.normal),
            ("slow_ms", self.slow),
            ("timeout_ms", self.timeout),
        ];
        match durations.into_iter().find(|(_, d)| d.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroDuration(name)),
            None => Ok(()),
        }
    }

    /// Extra delay before the next tick of `tier`, doubling with every
    /// failure past the threshold and capped at `max_backoff`.
    pub fn backoff(&self, tier: PollTier, failures: u32) -> Option<Duration> {
        if self.failure_threshold == 0 || failures < self.failure_threshold {
            return None;
        }
        let exponent = (failures - self.failure_threshold).min(16);
        let delay = self.interval(tier).saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_backoff))
    }
}

/// Everything the tier tasks of one device share.
pub struct PollContext {
    pub device_id: String,
    pub registers: HashMap<String, RegisterDescriptor>,
    pub plan: BatchPlan,
    pub evaluator: Evaluator,
    pub store: SharedStore,
    pub transport: SharedTransport,
    pub settings: SchedulerSettings,
    /// Consecutive failed batches across all tiers of the device.
    pub failures: AtomicU32,
    pub updates: broadcast::Sender<RegisterUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Drain began mid-pass; nothing after the in-flight read was applied.
    Abandoned,
}

/// Compiled register set of one device. Building it never talks to the
/// device, so configuration errors surface before a connection is made.
#[derive(Debug, Clone)]
pub struct DeviceModel {
    pub descriptors: Vec<RegisterDescriptor>,
    pub plan: BatchPlan,
    pub evaluator: Evaluator,
}

impl DeviceModel {
    pub fn compile(
        descriptors: Vec<RegisterDescriptor>,
        planner: PlannerSettings,
    ) -> Result<Self, ConfigError> {
        let mut names = HashSet::with_capacity(descriptors.len());
        for register in &descriptors {
            register.validate()?;
            if !names.insert(register.name.as_str()) {
                return Err(ConfigError::DuplicateName(register.name.clone()));
            }
        }
        let plan = planner::plan(&descriptors, planner)?;
        let evaluator = Evaluator::compile(&descriptors)?;
        Ok(Self {
            descriptors,
            plan,
            evaluator,
        })
    }
}

impl PollContext {
    pub fn new(
        device_id: impl Into<String>,
        model: DeviceModel,
        settings: SchedulerSettings,
        transport: Box<dyn Transport>,
        updates: broadcast::Sender<RegisterUpdate>,
    ) -> Self {
        let store = ValueStore::shared(&model.descriptors);
        let registers = model
            .descriptors
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        Self {
            device_id: device_id.into(),
            registers,
            plan: model.plan,
            evaluator: model.evaluator,
            store,
            transport: Arc::new(Mutex::new(Some(transport))),
            settings,
            failures: AtomicU32::new(0),
            updates,
        }
    }

    /// Tiers that need a task. A device with only derived registers still
    /// evaluates them on the normal tier.
    pub fn active_tiers(&self) -> Vec<PollTier> {
        let tiers: Vec<PollTier> = self.plan.tiers().collect();
        if tiers.is_empty() && !self.evaluator.is_empty() {
            return vec![PollTier::Normal];
        }
        tiers
    }

    async fn read_batch(&self, batch: &Batch) -> Result<Vec<u16>, TransportError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(TransportError::Closed)?;
        let words = transport
            .read_range(batch.bank, batch.start, batch.span, self.settings.timeout)
            .await?;
        if words.len() < usize::from(batch.span) {
            return Err(TransportError::ShortResponse {
                expected: usize::from(batch.span),
                actual: words.len(),
            });
        }
        Ok(words)
    }

    /// Run one pass of `tier`: read every batch, decode, derive, broadcast.
    pub async fn poll_tier(&self, tier: PollTier, drain: &watch::Receiver<bool>) -> TickOutcome {
        let started = Instant::now();
        let mut touched: Vec<String> = Vec::new();

        for batch in self.plan.tier(tier) {
            if *drain.borrow() {
                return TickOutcome::Abandoned;
            }
            let result = self.read_batch(batch).await;
            if *drain.borrow() {
                return TickOutcome::Abandoned;
            }

            let mut store = self.store.write().await;
            match result {
                Ok(words) => {
                    self.failures.store(0, Ordering::Relaxed);
                    counter!("modpoller_batches_total", "device" => self.device_id.clone(), "tier" => tier.to_string())
                        .increment(1);
                    debug!(
                        "Read {} words at {} ({} bank) from {}",
                        batch.span, batch.start, batch.bank, self.device_id
                    );
                    for member in &batch.members {
                        let Some(register) = self.registers.get(&member.name) else {
                            continue;
                        };
                        match decode_member(&words, batch.start, member.address, &register.format) {
                            Ok(value) => {
                                store.set_fresh(&member.name, value);
                            }
                            Err(e) => {
                                warn!("Failed to decode {} on {}: {}", member.name, self.device_id, e);
                                store.mark_unavailable(&member.name);
                            }
                        }
                    }
                }
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    counter!("modpoller_batch_failures_total", "device" => self.device_id.clone(), "tier" => tier.to_string())
                        .increment(1);
                    warn!(
                        "Reading {} words at {} ({} bank) from {} failed: {} ({} consecutive)",
                        batch.span, batch.start, batch.bank, self.device_id, e, failures
                    );
                    for name in batch.member_names() {
                        store.mark_stale(name);
                    }
                }
            }
            touched.extend(batch.member_names().map(String::from));
        }

        if *drain.borrow() {
            return TickOutcome::Abandoned;
        }
        let derived = {
            let mut store = self.store.write().await;
            self.evaluator.evaluate(&mut store)
        };
        touched.extend(derived);
        self.publish(&touched).await;

        histogram!("modpoller_tick_duration_seconds", "tier" => tier.to_string())
            .record(started.elapsed().as_secs_f64());
        TickOutcome::Completed
    }

    async fn publish(&self, names: &[String]) {
        if self.updates.receiver_count() == 0 {
            return;
        }
        let store = self.store.read().await;
        for name in names {
            if let Some(snapshot) = store.get(name) {
                // Only fails when every receiver is gone.
                let _ = self.updates.send(RegisterUpdate::new(&self.device_id, snapshot));
            }
        }
    }
}

async fn run_tier(ctx: Arc<PollContext>, tier: PollTier, mut drain: watch::Receiver<bool>) {
    let period = ctx.settings.interval(tier);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Polling {} tier of {} every {:?}", tier, ctx.device_id, period);

    let mut busy_until: Option<Instant> = None;
    loop {
        let deadline = tokio::select! {
            deadline = ticker.tick() => deadline,
            _ = drain.changed() => break,
        };
        if *drain.borrow() {
            break;
        }
        // The interval still yields one late tick after an overrun.
        if busy_until.is_some_and(|until| deadline < until) {
            debug!("Skipping {} tick of {}, previous pass overran", tier, ctx.device_id);
            counter!("modpoller_ticks_skipped_total", "device" => ctx.device_id.clone(), "tier" => tier.to_string())
                .increment(1);
            continue;
        }
        if ctx.poll_tier(tier, &drain).await == TickOutcome::Abandoned {
            break;
        }
        busy_until = Some(Instant::now());

        let failures = ctx.failures.load(Ordering::Relaxed);
        if let Some(delay) = ctx.settings.backoff(tier, failures) {
            warn!(
                "{} tier of {} backing off for {:?} after {} failures",
                tier, ctx.device_id, delay, failures
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => ticker.reset(),
                _ = drain.changed() => break,
            }
        }
    }
    debug!("{} tier of {} stopped", tier, ctx.device_id);
}

/// Handle to the tier tasks of one device.
pub struct Scheduler {
    drain: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(ctx: Arc<PollContext>) -> Self {
        let (drain, _) = watch::channel(false);
        let tasks = ctx
            .active_tiers()
            .into_iter()
            .map(|tier| tokio::spawn(run_tier(ctx.clone(), tier, drain.subscribe())))
            .collect();
        Self {
            drain,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn is_draining(&self) -> bool {
        *self.drain.borrow()
    }

    /// Stop issuing ticks and wait for in-flight batches to finish or time out.
    pub async fn drain(&self) {
        self.drain.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Tier task ended abnormally: {}", e);
            }
        }
    }
}
