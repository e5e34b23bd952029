use async_trait::async_trait;

use super::LimitedFuture;
use crate::{Limiter, Outcome, PoolError};

/// A pool of scarce resources, e.g. database connections.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    /// What the pool hands out, e.g. a connection.
    type Resource: Send;
    /// Why the pool couldn't hand out a resource.
    type Error: Send;

    /// Take a resource from the pool.
    async fn get(&self) -> Result<Self::Resource, Self::Error>;
}

/// The context of a request for a pooled resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolContext {
    username: Option<String>,
}

impl PoolContext {
    /// A request made with a user's credentials.
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
        }
    }

    /// The user acquiring the resource, if known.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// A partition key resolver which partitions requests by user.
    pub fn by_username() -> impl Fn(&PoolContext) -> Option<String> + Send + Sync + 'static {
        |ctx: &PoolContext| ctx.username.clone()
    }
}

/// Applies a [Limiter] to taking resources from a [ResourcePool].
///
/// Only taking the resource is limited, not its use. Getting a resource counts as a success and
/// failing to get one is ignored.
///
/// When not admitted, fails with [PoolError::CannotAcquire] without asking the pool. Errors from
/// the pool itself, including its own exhaustion, are passed through as [PoolError::Pool].
#[derive(Debug)]
pub struct LimitedPool<P, L> {
    pool: P,
    limiter: L,
}

impl<P, L> LimitedPool<P, L>
where
    P: ResourcePool,
    L: Limiter<PoolContext>,
{
    /// Limit acquisitions from `pool` with `limiter`.
    pub fn new(pool: P, limiter: L) -> Self {
        Self { pool, limiter }
    }

    /// The wrapped pool.
    pub fn inner(&self) -> &P {
        &self.pool
    }

    /// Take a resource from the pool, if admitted.
    pub async fn get(&self, ctx: &PoolContext) -> Result<P::Resource, PoolError<P::Error>> {
        let listener = self.limiter.acquire(ctx).await.map_err(|error| {
            tracing::debug!(%error, username = ctx.username(), "resource acquisition rejected");
            PoolError::CannotAcquire(error)
        })?;

        LimitedFuture::new(
            self.pool.get(),
            listener,
            got_resource::<P::Resource, P::Error>,
        )
        .await
        .map_err(PoolError::Pool)
    }
}

fn got_resource<T, E>(result: &Result<T, E>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(_) => Outcome::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{gateway::testing::Recording, AcquireError, PartitionedLimiter};

    /// Hands out numbered connections until it runs out.
    #[derive(Debug)]
    struct Connections {
        size: usize,
        taken: AtomicUsize,
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Exhausted;

    impl Connections {
        fn new(size: usize) -> Self {
            Self {
                size,
                taken: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ResourcePool for Connections {
        type Resource = usize;
        type Error = Exhausted;

        async fn get(&self) -> Result<usize, Exhausted> {
            let id = self.taken.fetch_add(1, Ordering::SeqCst);
            if id < self.size {
                Ok(id)
            } else {
                Err(Exhausted)
            }
        }
    }

    #[tokio::test]
    async fn reports_acquisitions() {
        let limiter = Recording::new(10);
        let pool = LimitedPool::new(Connections::new(1), limiter.clone());
        let ctx = PoolContext::for_user("app");

        assert_eq!(pool.get(&ctx).await.unwrap(), 0);
        assert!(matches!(pool.get(&ctx).await, Err(PoolError::Pool(Exhausted))));

        assert_eq!(limiter.outcomes(), vec![Outcome::Success, Outcome::Ignore]);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn rejection_is_distinct_from_exhaustion() {
        let limiter = Recording::new(1);
        let pool = LimitedPool::new(Connections::new(10), limiter.clone());
        let _busy = limiter.try_acquire(&()).unwrap();

        assert!(matches!(
            pool.get(&PoolContext::default()).await,
            Err(PoolError::CannotAcquire(AcquireError::Rejected))
        ));
        assert_eq!(pool.inner().taken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let limiter = Arc::new(
            PartitionedLimiter::<PoolContext>::builder()
                .limit(2)
                .partition("reporting", 1.0)
                .partition("checkout", 1.0)
                .partition_resolver(PoolContext::by_username())
                .build(),
        );
        let pool = LimitedPool::new(Connections::new(10), Arc::clone(&limiter));

        pool.get(&PoolContext::for_user("reporting")).await.unwrap();
        let _busy = limiter
            .partition("reporting")
            .unwrap()
            .try_acquire(&())
            .unwrap();

        assert!(matches!(
            pool.get(&PoolContext::for_user("reporting")).await,
            Err(PoolError::CannotAcquire(_))
        ));
        assert!(pool.get(&PoolContext::for_user("checkout")).await.is_ok());
    }
}
