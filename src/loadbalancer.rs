//! Client-side weighted load balancer with failure quarantine.
//!
//! Unique responsibility: pick one resource out of a weighted list, take failing
//! resources out of rotation for a fixed quarantine period, and put them back
//! once that period has elapsed.
//!
//! ```text
//! select_at(now)
//!     → re-enable resources whose quarantine elapsed (weights recomputed, usage reset)
//!     → apply policy over available resources:
//!         - RoundRobin: first resource whose usage ratio is under its weight
//!         - Random: weighted random draw
//!     → usage_count += 1, return Selection
//!
//! mark_unavailable_at(id, cause, error, now)
//!     → available = false, weight split equally among remaining available resources
//! ```
//!
//! Re-introduction is time-based only; there is no active health check. Callers
//! report failures (connect errors, 5xx, ...) and the balancer routes around them.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Default quarantine period for a failing resource.
pub const DEFAULT_QUARANTINE: Duration = Duration::from_secs(10);

const WEIGHT_EPSILON: f64 = 1e-9;

/// Selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingPolicy {
    /// Weighted round robin driven by observed usage ratios.
    #[default]
    RoundRobin,
    /// Weighted random draw.
    Random,
}

impl LoadBalancingPolicy {
    /// Parse a policy name (`round_robin`, `random`, case-insensitive).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

impl fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round_robin"),
            Self::Random => f.write_str("random"),
        }
    }
}

/// Why a resource was taken out of rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unavailability {
    /// Short cause, e.g. `"HTTP 503"` or `"connect error"`.
    pub cause: String,
    /// Underlying error text, if any.
    pub error: Option<String>,
    /// When the resource was marked unavailable (ms since epoch).
    pub since_ms: u64,
}

/// A resource with its weighting and availability state.
#[derive(Debug, Clone)]
pub struct LoadBalancingResource<R> {
    id: String,
    resource: R,
    default_weight: f64,
    current_weight: f64,
    usage_count: u64,
    available: bool,
    unavailability: Option<Unavailability>,
}

impl<R> LoadBalancingResource<R> {
    fn usage_ratio(&self, total_usage: u64) -> f64 {
        if total_usage == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.usage_count as f64 / total_usage as f64;
        ratio
    }
}

/// Input for [`LoadBalancer::with_weights`].
#[derive(Debug, Clone)]
pub struct WeightedResource<R> {
    /// Unique identifier.
    pub id: String,
    /// Payload handed back on selection.
    pub resource: R,
    /// Relative weight (normalized against the other resources).
    pub weight: f64,
}

impl<R> WeightedResource<R> {
    /// Create a weighted resource.
    pub fn new(id: impl Into<String>, resource: R, weight: f64) -> Self {
        Self {
            id: id.into(),
            resource,
            weight,
        }
    }
}

/// Result of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<R> {
    /// Identifier of the selected resource, to report failures against.
    pub id: String,
    /// The selected payload.
    pub resource: R,
}

/// Serializable view of one resource (payload excluded).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Identifier.
    pub id: String,
    /// Normalized default weight.
    pub default_weight: f64,
    /// Current weight after redistribution.
    pub current_weight: f64,
    /// Number of selections since the last rebalance.
    pub usage_count: u64,
    /// Whether the resource is in rotation.
    pub available: bool,
    /// Unavailability metadata, set while out of rotation.
    pub unavailability: Option<Unavailability>,
}

/// Errors for load balancer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadBalancerError {
    /// Every resource is unavailable (or the balancer is empty).
    #[error("no resource available")]
    NoResourceAvailable,
    /// The given id does not belong to this balancer.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// Two resources share the same id.
    #[error("duplicate resource id: {0}")]
    DuplicateResource(String),
    /// Weights are negative or non-finite, or their sum is zero or overflows.
    #[error("invalid weights: {0}")]
    InvalidWeights(&'static str),
}

/// Weighted load balancer shared across tasks (wrap it in `Arc`).
#[derive(Debug)]
pub struct LoadBalancer<R> {
    policy: LoadBalancingPolicy,
    quarantine: Duration,
    resources: Mutex<Vec<LoadBalancingResource<R>>>,
}

impl<R: Clone> LoadBalancer<R> {
    /// Create a balancer giving every resource the same weight.
    ///
    /// # Errors
    ///
    /// Returns an error if two resources share an id.
    pub fn new<I, S>(policy: LoadBalancingPolicy, resources: I) -> Result<Self, LoadBalancerError>
    where
        I: IntoIterator<Item = (S, R)>,
        S: Into<String>,
    {
        Self::with_weights(
            policy,
            resources
                .into_iter()
                .map(|(id, r)| WeightedResource::new(id, r, 1.0)),
        )
    }

    /// Create a balancer from explicitly weighted resources.
    ///
    /// Weights are normalized so they sum to 1. An empty list is accepted; every
    /// selection on it fails with [`LoadBalancerError::NoResourceAvailable`].
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate ids or invalid weights.
    pub fn with_weights<I>(policy: LoadBalancingPolicy, resources: I) -> Result<Self, LoadBalancerError>
    where
        I: IntoIterator<Item = WeightedResource<R>>,
    {
        let input: Vec<WeightedResource<R>> = resources.into_iter().collect();

        let mut seen = std::collections::HashSet::new();
        for r in &input {
            if !seen.insert(r.id.as_str()) {
                return Err(LoadBalancerError::DuplicateResource(r.id.clone()));
            }
            if !r.weight.is_finite() || r.weight < 0.0 {
                return Err(LoadBalancerError::InvalidWeights("weights must be finite and >= 0"));
            }
        }

        let total: f64 = input.iter().map(|r| r.weight).sum();
        if !input.is_empty() && total <= 0.0 {
            return Err(LoadBalancerError::InvalidWeights("weights must sum to a positive value"));
        }
        if !total.is_finite() {
            return Err(LoadBalancerError::InvalidWeights("sum of weights overflows"));
        }

        let resources = input
            .into_iter()
            .map(|r| {
                let w = r.weight / total;
                LoadBalancingResource {
                    id: r.id,
                    resource: r.resource,
                    default_weight: w,
                    current_weight: w,
                    usage_count: 0,
                    available: true,
                    unavailability: None,
                }
            })
            .collect();

        Ok(Self {
            policy,
            quarantine: DEFAULT_QUARANTINE,
            resources: Mutex::new(resources),
        })
    }

    /// Set the quarantine period applied to failing resources.
    #[must_use]
    pub const fn with_quarantine(mut self, quarantine: Duration) -> Self {
        self.quarantine = quarantine;
        self
    }

    /// Selection policy in use.
    #[must_use]
    pub const fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Quarantine period in use.
    #[must_use]
    pub const fn quarantine(&self) -> Duration {
        self.quarantine
    }

    /// Number of resources (available or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when the balancer holds no resource at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of resources currently in rotation.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.lock().iter().filter(|r| r.available).count()
    }

    /// Select a resource using the current time.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::NoResourceAvailable`] if every resource is quarantined.
    pub fn select(&self) -> Result<Selection<R>, LoadBalancerError> {
        self.select_at(now_unix_ms())
    }

    /// Select a resource as of `now_ms` (ms since epoch).
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::NoResourceAvailable`] if every resource is quarantined.
    pub fn select_at(&self, now_ms: u64) -> Result<Selection<R>, LoadBalancerError> {
        let mut resources = self.lock();
        self.release_expired(&mut resources, now_ms);

        let index = match self.policy {
            LoadBalancingPolicy::RoundRobin => pick_round_robin(&resources),
            LoadBalancingPolicy::Random => pick_random(&resources),
        }
        .ok_or(LoadBalancerError::NoResourceAvailable)?;

        let chosen = &mut resources[index];
        chosen.usage_count = chosen.usage_count.saturating_add(1);
        tracing::debug!(id = %chosen.id, usage = chosen.usage_count, weight = chosen.current_weight, "resource selected");

        Ok(Selection {
            id: chosen.id.clone(),
            resource: chosen.resource.clone(),
        })
    }

    /// Take a resource out of rotation using the current time.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::UnknownResource`] if `id` is not part of this balancer.
    pub fn mark_unavailable(
        &self,
        id: &str,
        cause: impl Into<String>,
        error: Option<String>,
    ) -> Result<(), LoadBalancerError> {
        self.mark_unavailable_at(id, cause, error, now_unix_ms())
    }

    /// Take a resource out of rotation as of `now_ms`.
    ///
    /// Its current weight is split equally among the remaining available
    /// resources. Marking an already quarantined resource refreshes its
    /// metadata and restarts the quarantine.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::UnknownResource`] if `id` is not part of this balancer.
    pub fn mark_unavailable_at(
        &self,
        id: &str,
        cause: impl Into<String>,
        error: Option<String>,
        now_ms: u64,
    ) -> Result<(), LoadBalancerError> {
        let mut resources = self.lock();
        let index = position(&resources, id)?;

        let cause = cause.into();
        tracing::warn!(id, cause = %cause, error = ?error, quarantine_ms = duration_ms(self.quarantine), "resource marked unavailable");

        let target = &mut resources[index];
        target.unavailability = Some(Unavailability {
            cause,
            error,
            since_ms: now_ms,
        });
        if !target.available {
            return Ok(());
        }
        target.available = false;
        let released = target.current_weight;
        target.current_weight = 0.0;

        let remaining = resources.iter().filter(|r| r.available).count();
        if remaining > 0 {
            #[allow(clippy::cast_precision_loss)]
            let share = released / remaining as f64;
            for r in resources.iter_mut().filter(|r| r.available) {
                r.current_weight += share;
            }
        }
        Ok(())
    }

    /// Put a resource back into rotation before its quarantine elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::UnknownResource`] if `id` is not part of this balancer.
    pub fn mark_available(&self, id: &str) -> Result<(), LoadBalancerError> {
        let mut resources = self.lock();
        let index = position(&resources, id)?;
        if resources[index].available {
            return Ok(());
        }
        let target = &mut resources[index];
        target.available = true;
        target.unavailability = None;
        tracing::info!(id, "resource re-enabled manually");
        rebalance(&mut resources);
        Ok(())
    }

    /// Snapshot of every resource, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        self.lock()
            .iter()
            .map(|r| ResourceSnapshot {
                id: r.id.clone(),
                default_weight: r.default_weight,
                current_weight: r.current_weight,
                usage_count: r.usage_count,
                available: r.available,
                unavailability: r.unavailability.clone(),
            })
            .collect()
    }

    fn release_expired(&self, resources: &mut [LoadBalancingResource<R>], now_ms: u64) {
        let quarantine_ms = duration_ms(self.quarantine);
        let mut released = false;

        for r in resources.iter_mut().filter(|r| !r.available) {
            let since = r.unavailability.as_ref().map_or(0, |u| u.since_ms);
            if now_ms.saturating_sub(since) >= quarantine_ms {
                r.available = true;
                r.unavailability = None;
                released = true;
                tracing::info!(id = %r.id, "quarantine elapsed, resource re-enabled");
            }
        }

        if released {
            rebalance(resources);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LoadBalancingResource<R>>> {
        // State stays consistent between statements, so a poisoned lock is still usable.
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn position<R>(resources: &[LoadBalancingResource<R>], id: &str) -> Result<usize, LoadBalancerError> {
    resources
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| LoadBalancerError::UnknownResource(id.to_string()))
}

/// Recompute weights from defaults and reset usage counters.
///
/// Available resources get their default weight plus an equal share of the
/// defaults held by the resources still out of rotation.
fn rebalance<R>(resources: &mut [LoadBalancingResource<R>]) {
    let available = resources.iter().filter(|r| r.available).count();
    let parked: f64 = resources
        .iter()
        .filter(|r| !r.available)
        .map(|r| r.default_weight)
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let share = if available > 0 { parked / available as f64 } else { 0.0 };

    for r in resources.iter_mut() {
        r.usage_count = 0;
        r.current_weight = if r.available { r.default_weight + share } else { 0.0 };
    }
}

fn pick_round_robin<R>(resources: &[LoadBalancingResource<R>]) -> Option<usize> {
    let total_usage: u64 = resources
        .iter()
        .filter(|r| r.available)
        .map(|r| r.usage_count)
        .sum();

    let under_share = resources.iter().position(|r| {
        r.available
            && r.current_weight > WEIGHT_EPSILON
            && r.usage_ratio(total_usage) < r.current_weight - WEIGHT_EPSILON
    });
    if under_share.is_some() {
        return under_share;
    }

    // Everyone sits exactly at its share: take the largest deficit.
    let any_weighted = resources
        .iter()
        .any(|r| r.available && r.current_weight > WEIGHT_EPSILON);

    let mut best: Option<(usize, f64)> = None;
    for (i, r) in resources.iter().enumerate() {
        if !r.available || (any_weighted && r.current_weight <= WEIGHT_EPSILON) {
            continue;
        }
        let deficit = r.current_weight - r.usage_ratio(total_usage);
        match best {
            Some((_, d)) if deficit <= d + WEIGHT_EPSILON => {}
            _ => best = Some((i, deficit)),
        }
    }
    best.map(|(i, _)| i)
}

fn pick_random<R>(resources: &[LoadBalancingResource<R>]) -> Option<usize> {
    let candidates: Vec<usize> = resources
        .iter()
        .enumerate()
        .filter(|(_, r)| r.available)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let mut rng = rand::thread_rng();
    let total: f64 = candidates.iter().map(|&i| resources[i].current_weight).sum();
    if total <= WEIGHT_EPSILON {
        return Some(candidates[rng.gen_range(0..candidates.len())]);
    }

    let mut draw = rng.gen_range(0.0..total);
    for &i in &candidates {
        let w = resources[i].current_weight;
        if draw < w {
            return Some(i);
        }
        draw -= w;
    }
    // Float rounding on the last bucket.
    candidates
        .iter()
        .rev()
        .copied()
        .find(|&i| resources[i].current_weight > WEIGHT_EPSILON)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Utility: current timestamp in milliseconds since UNIX epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    let Ok(dur) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}
