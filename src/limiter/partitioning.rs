use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use conv::ConvAsUtil;
use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    error::AcquireError, limits::Fixed, BlockingLimiter, DefaultLimiter, Limiter, Listener,
};

type Resolver<C> = Box<dyn Fn(&C) -> Option<String> + Send + Sync>;
type Factory<L> = Box<dyn Fn(usize) -> L + Send + Sync>;

/// What to do with a job which doesn't map to a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Admit it without any limit. Its listener isn't counted anywhere.
    Unlimited,
    /// Reject it.
    Reject,
    /// Send it to the named partition, which must be configured.
    Partition(String),
}

#[derive(Debug, Clone, Copy)]
struct DynamicPartitions {
    weight: f64,
    max: usize,
}

/// A limiter which splits jobs into independently limited partitions.
///
/// Each job's partition is found by applying a key resolver to its context. Every partition gets
/// its own child limiter, so a busy partition can't starve the others.
///
/// Partitions get a share of the total limit according to their weight. The weights will be
/// normalised. E.g. weights of 2, 2 and 4 will result in partitions of 25%, 25% and 50% of the
/// total limit, respectively. Partition limits are rounded up and have a minimum of 1, so the total
/// concurrency might exceed the total limit.
///
/// Child limiters are created on first use. Exactly one child exists per partition key, for the
/// lifetime of the limiter.
///
/// Jobs which resolve to no key, or to a key which isn't configured, take the [Fallback]. Unknown
/// keys can be given partitions of their own with
/// [dynamic_partitions](PartitionedLimiterBuilder::dynamic_partitions), up to a fixed number of
/// them.
pub struct PartitionedLimiter<C: ?Sized, L = DefaultLimiter<Fixed>> {
    limit: usize,
    weights: HashMap<String, f64>,
    total_weight: f64,
    resolver: Option<Resolver<C>>,
    fallback: Fallback,
    dynamic: Option<DynamicPartitions>,
    factory: Factory<L>,

    partitions: DashMap<String, Arc<L>>,
    /// May briefly overcount while two callers race to create the same partition.
    dynamic_count: AtomicUsize,
}

/// Configures a [PartitionedLimiter].
pub struct PartitionedLimiterBuilder<C: ?Sized, L = DefaultLimiter<Fixed>> {
    limit: usize,
    weights: Vec<(String, f64)>,
    resolver: Option<Resolver<C>>,
    fallback: Fallback,
    dynamic: Option<DynamicPartitions>,
    factory: Factory<L>,
}

impl<C: ?Sized> PartitionedLimiter<C> {
    /// Start configuring a partitioned limiter, with fixed-limit [DefaultLimiter]s as partitions.
    ///
    /// Jobs which don't map to a partition are admitted without any limit unless a different
    /// [Fallback] is set. Use [Fallback::Reject] or [Fallback::Partition] to keep them limited.
    pub fn builder() -> PartitionedLimiterBuilder<C> {
        PartitionedLimiterBuilder {
            limit: Self::DEFAULT_LIMIT,
            weights: Vec::new(),
            resolver: None,
            fallback: Fallback::Unlimited,
            dynamic: None,
            factory: Box::new(|limit| DefaultLimiter::new(Fixed::new(limit))),
        }
    }

    const DEFAULT_LIMIT: usize = 20;
}

impl<C: ?Sized, L> PartitionedLimiterBuilder<C, L> {
    /// The total limit, shared between the partitions.
    pub fn limit(mut self, limit: usize) -> Self {
        assert!(limit > 0);
        self.limit = limit;
        self
    }

    /// Add a named partition with a relative weight.
    pub fn partition(mut self, name: impl Into<String>, weight: f64) -> Self {
        assert!(weight > 0. && weight.is_finite(), "weights must be positive");
        self.weights.push((name.into(), weight));
        self
    }

    /// How to find the partition key for a job. Without a resolver, every job takes the
    /// [Fallback].
    pub fn partition_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&C) -> Option<String> + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// What to do with jobs without a partition. Defaults to [Fallback::Unlimited], so unknown
    /// or missing keys are not limited at all.
    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Give unknown keys a partition of their own, each with the given weight, up to `max` of
    /// them. Once `max` is reached, further unknown keys take the [Fallback].
    ///
    /// With no configured partitions, `weight` is taken as a fraction of the total limit.
    pub fn dynamic_partitions(mut self, weight: f64, max: usize) -> Self {
        assert!(weight > 0. && weight.is_finite(), "weights must be positive");
        self.dynamic = Some(DynamicPartitions { weight, max });
        self
    }

    /// How to create the limiter for a partition, given its share of the total limit.
    pub fn child_factory<M, F>(self, factory: F) -> PartitionedLimiterBuilder<C, M>
    where
        F: Fn(usize) -> M + Send + Sync + 'static,
    {
        PartitionedLimiterBuilder {
            limit: self.limit,
            weights: self.weights,
            resolver: self.resolver,
            fallback: self.fallback,
            dynamic: self.dynamic,
            factory: Box::new(factory),
        }
    }

    /// Build the limiter. Panics if the fallback partition hasn't been added.
    pub fn build(self) -> PartitionedLimiter<C, L> {
        let weights: HashMap<String, f64> = self.weights.into_iter().collect();

        if let Fallback::Partition(name) = &self.fallback {
            assert!(
                weights.contains_key(name),
                "fallback partition {name:?} is not configured"
            );
        }

        let total_weight = weights.values().sum::<f64>();

        PartitionedLimiter {
            limit: self.limit,
            total_weight: if total_weight > 0. { total_weight } else { 1. },
            weights,
            resolver: self.resolver,
            fallback: self.fallback,
            dynamic: self.dynamic,
            factory: self.factory,
            partitions: DashMap::new(),
            dynamic_count: AtomicUsize::new(0),
        }
    }

    /// Build the limiter, with each partition waiting for capacity instead of rejecting.
    ///
    /// Every partition gets its own wait queue, so callers waiting on a busy partition never hold
    /// up callers for another one.
    pub fn block_on_limit(
        self,
        timeout: Option<Duration>,
    ) -> PartitionedLimiter<C, BlockingLimiter<L>>
    where
        L: 'static,
    {
        let Self {
            limit,
            weights,
            resolver,
            fallback,
            dynamic,
            factory,
        } = self;

        PartitionedLimiterBuilder {
            limit,
            weights,
            resolver,
            fallback,
            dynamic,
            factory: Box::new(move |limit| {
                let limiter = BlockingLimiter::new(factory(limit));
                match timeout {
                    Some(timeout) => limiter.with_timeout(timeout),
                    None => limiter,
                }
            }),
        }
        .build()
    }
}

impl<C: ?Sized, L> PartitionedLimiter<C, L> {
    /// The limiter for a partition, if it has been created.
    pub fn partition(&self, name: &str) -> Option<Arc<L>> {
        self.partitions.get(name).map(|p| Arc::clone(p.value()))
    }

    /// The names of all partitions created so far.
    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.iter().map(|p| p.key().clone()).collect()
    }

    /// The number of partitions created for unknown keys.
    pub fn dynamic_partitions(&self) -> usize {
        self.dynamic_count.load(atomic::Ordering::SeqCst)
    }

    /// The limit given to a partition with the given weight.
    fn limit_for(&self, weight: f64) -> usize {
        fractional_limit(self.limit, (weight / self.total_weight).min(1.))
    }

    /// Find or create the limiter for `key`.
    ///
    /// Returns `None` if the key should take the fallback.
    fn resolve_partition(&self, key: &str) -> Option<Arc<L>> {
        if let Some(existing) = self.partition(key) {
            return Some(existing);
        }

        if let Some(&weight) = self.weights.get(key) {
            let limiter = self
                .partitions
                .entry(key.to_owned())
                .or_insert_with(|| {
                    let limit = self.limit_for(weight);
                    tracing::debug!(partition = key, limit, "creating partition");
                    Arc::new((self.factory)(limit))
                })
                .clone();
            return Some(limiter);
        }

        let dynamic = self.dynamic?;

        let reserved = self
            .dynamic_count
            .fetch_update(atomic::Ordering::SeqCst, atomic::Ordering::SeqCst, |n| {
                (n < dynamic.max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            tracing::debug!(
                partition = key,
                max = dynamic.max,
                "too many dynamic partitions, using fallback"
            );
            return None;
        }

        match self.partitions.entry(key.to_owned()) {
            Entry::Occupied(existing) => {
                // Someone else created it first.
                self.dynamic_count.fetch_sub(1, atomic::Ordering::SeqCst);
                Some(Arc::clone(existing.get()))
            }
            Entry::Vacant(vacant) => {
                let limit = self.limit_for(dynamic.weight);
                tracing::debug!(partition = key, limit, "creating dynamic partition");
                let limiter = Arc::new((self.factory)(limit));
                vacant.insert(Arc::clone(&limiter));
                Some(limiter)
            }
        }
    }

    fn route(&self, ctx: &C) -> Route<L> {
        let partition = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver(ctx))
            .and_then(|key| self.resolve_partition(&key));

        if let Some(partition) = partition {
            return Route::Partition(partition);
        }

        match &self.fallback {
            Fallback::Unlimited => Route::Unlimited,
            Fallback::Reject => Route::Reject,
            Fallback::Partition(name) => self
                .resolve_partition(name)
                .map_or(Route::Reject, Route::Partition),
        }
    }
}

enum Route<L> {
    Partition(Arc<L>),
    Unlimited,
    Reject,
}

#[async_trait]
impl<C, L> Limiter<C> for PartitionedLimiter<C, L>
where
    C: ?Sized + Sync,
    L: Limiter<C>,
{
    fn try_acquire(&self, ctx: &C) -> Option<Listener> {
        match self.route(ctx) {
            Route::Partition(limiter) => limiter.try_acquire(ctx),
            Route::Unlimited => Some(Listener::unlimited()),
            Route::Reject => {
                tracing::debug!("rejected: no partition");
                None
            }
        }
    }

    async fn acquire(&self, ctx: &C) -> Result<Listener, AcquireError> {
        match self.route(ctx) {
            Route::Partition(limiter) => limiter.acquire(ctx).await,
            Route::Unlimited => Ok(Listener::unlimited()),
            Route::Reject => {
                tracing::debug!("rejected: no partition");
                Err(AcquireError::Rejected)
            }
        }
    }
}

impl<C: ?Sized, L: fmt::Debug> fmt::Debug for PartitionedLimiter<C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedLimiter")
            .field("limit", &self.limit)
            .field("weights", &self.weights)
            .field("fallback", &self.fallback)
            .field("dynamic", &self.dynamic)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl<C: ?Sized, L> fmt::Debug for PartitionedLimiterBuilder<C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedLimiterBuilder")
            .field("limit", &self.limit)
            .field("weights", &self.weights)
            .field("fallback", &self.fallback)
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

fn fractional_limit(limit: usize, fraction: f64) -> usize {
    let limit_f64 = limit as f64 * fraction;

    let limit: usize = limit_f64
        .ceil()
        .approx()
        .expect("should be clamped within usize bounds");

    limit.max(1)
}
