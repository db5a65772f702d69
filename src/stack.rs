//! Pre-packaged composition of the core policies around one operation.
//!
//! Stacking is just nesting wrapper forms at the call site; this builder
//! packages the common order Retry → CircuitBreaker → Bulkhead → Timeout.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::{ConfigError, PolicyError};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fixed composition of retry, circuit breaking, bulkheading, and timeout.
pub struct PolicyStack<E> {
    retry: RetryPolicy<E>,
    circuit_breaker: CircuitBreakerPolicy<E>,
    bulkhead: BulkheadPolicy,
    timeout: TimeoutPolicy,
}

impl<E> Clone for PolicyStack<E> {
    fn clone(&self) -> Self {
        Self {
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            bulkhead: self.bulkhead.clone(),
            timeout: self.timeout.clone(),
        }
    }
}

impl<E> PolicyStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> PolicyStackBuilder<E> {
        PolicyStackBuilder::new()
    }

    /// Run one operation through the whole stack, building from the inside
    /// out: Timeout closest to the operation, Retry outermost.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = Arc::clone(&op_cell);
                let circuit_breaker = self.circuit_breaker.clone();
                let bulkhead = self.bulkhead.clone();
                let timeout = self.timeout.clone();

                async move {
                    circuit_breaker
                        .execute(|| {
                            let op = Arc::clone(&op);
                            let bulkhead = bulkhead.clone();
                            let timeout = timeout.clone();
                            async move {
                                bulkhead
                                    .execute(|| {
                                        let op = Arc::clone(&op);
                                        let timeout = timeout.clone();
                                        async move {
                                            timeout
                                                .execute(|| {
                                                    let mut op = op
                                                        .lock()
                                                        .unwrap_or_else(|p| p.into_inner());
                                                    (&mut *op)()
                                                })
                                                .await
                                        }
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }
}

pub struct PolicyStackBuilder<E> {
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<CircuitBreakerPolicy<E>>,
    bulkhead: Option<BulkheadPolicy>,
    timeout: Option<TimeoutPolicy>,
}

impl<E> PolicyStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { retry: None, circuit_breaker: None, bulkhead: None, timeout: None }
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, policy: CircuitBreakerPolicy<E>) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    pub fn bulkhead(mut self, policy: BulkheadPolicy) -> Self {
        self.bulkhead = Some(policy);
        self
    }

    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(policy);
        self
    }

    /// Assemble the stack, filling unset layers with permissive defaults.
    pub fn build(self) -> Result<PolicyStack<E>, ConfigError> {
        let retry = match self.retry {
            Some(policy) => policy,
            None => RetryPolicy::builder().build()?,
        };
        let circuit_breaker = match self.circuit_breaker {
            Some(policy) => policy,
            None => CircuitBreakerPolicy::new(5, Duration::from_secs(60))?,
        };
        let bulkhead = match self.bulkhead {
            Some(policy) => policy,
            None => BulkheadPolicy::new(100, 100)?,
        };
        let timeout = match self.timeout {
            Some(policy) => policy,
            None => TimeoutPolicy::new(Duration::from_secs(30))?,
        };

        Ok(PolicyStack { retry, circuit_breaker, bulkhead, timeout })
    }
}

impl<E> Default for PolicyStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
