use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::build_lock::{BuildClaim, BuildGuard, BuildLocks};
use crate::cache::{CacheEntry, KeyPolicy, ReportCache, ReportKey};
use crate::pipeline::{Pipeline, RunFailure};

type BuildOutcome = Result<CacheEntry, RunFailure>;

/// Slack a waiter gives the builder to publish its own timeout
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

/// How a delivered report was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrigin {
    Cache,
    /// This request ran the build
    Built,
    /// Another request's build was awaited
    Joined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportReceipt {
    pub entry: CacheEntry,
    pub origin: DeliveryOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureNotice {
    pub key: ReportKey,
    pub reason: RunFailure,
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Could not generate the report for {}: {}", self.key, self.reason)
    }
}

/// What the requester eventually receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Report(ReportReceipt),
    Failure(FailureNotice),
}

impl Delivery {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Delivery::Report(receipt) => Some(&receipt.entry),
            Delivery::Failure(_) => None,
        }
    }
}

/// Acknowledgement of a trigger. Dropping it abandons the request, though a
/// build the request started still runs to completion.
pub struct ReportTicket {
    key: ReportKey,
    rx: oneshot::Receiver<Delivery>,
}

impl ReportTicket {
    pub fn key(&self) -> &ReportKey {
        &self.key
    }

    pub async fn delivery(self) -> Delivery {
        match self.rx.await {
            Ok(delivery) => delivery,
            Err(_) => Delivery::Failure(FailureNotice {
                key: self.key,
                reason: RunFailure::Aborted("report task ended without answering".to_string()),
            }),
        }
    }
}

/// Serves reports from the cache and runs at most one build per key.
///
/// A build runs in its own task. It keeps going when the requester that
/// started it goes away, bounded by the generation timeout, so waiters
/// joined on it are still answered.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    cache: Arc<ReportCache>,
    locks: BuildLocks<BuildOutcome>,
    policy: KeyPolicy,
    generation_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        cache: Arc<ReportCache>,
        policy: KeyPolicy,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            cache,
            locks: BuildLocks::new(),
            policy,
            generation_timeout,
        }
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    /// Builds currently running
    pub fn builds_in_flight(&self) -> usize {
        self.locks.in_flight()
    }

    pub fn key_for(&self, session: Option<&str>) -> ReportKey {
        self.policy.key_for(self.cache.now(), session)
    }

    /// Spawn the request and return at once. The delivery arrives through
    /// the ticket.
    pub fn trigger(self: &Arc<Self>, session: Option<&str>) -> ReportTicket {
        let key = self.key_for(session);
        let (mut tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let task_key = key.clone();

        tokio::spawn(async move {
            let delivery = tokio::select! {
                delivery = this.generate_for(task_key) => Some(delivery),
                _ = tx.closed() => None,
            };
            match delivery {
                Some(delivery) => {
                    let _ = tx.send(delivery);
                }
                None => debug!("ticket dropped, report request abandoned"),
            }
        });

        ReportTicket { key, rx }
    }

    /// Answer one request in place
    pub async fn generate(self: &Arc<Self>, session: Option<&str>) -> Delivery {
        self.generate_for(self.key_for(session)).await
    }

    async fn generate_for(self: &Arc<Self>, key: ReportKey) -> Delivery {
        let span = info_span!("report", key = %key, run_id = tracing::field::Empty);
        self.serve(key).instrument(span).await
    }

    async fn serve(self: &Arc<Self>, key: ReportKey) -> Delivery {
        loop {
            if let Some(entry) = self.cache.lookup(&key).await {
                info!("cache hit, expires at {}", entry.expires_at);
                return Delivery::Report(ReportReceipt { entry, origin: DeliveryOrigin::Cache });
            }

            match self.locks.claim(&key) {
                BuildClaim::Acquired(guard) => {
                    let this = Arc::clone(self);
                    let build = tokio::spawn(async move { this.build(guard).await }.instrument(Span::current()));
                    return match build.await {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            error!("build task failed: {}", e);
                            Delivery::Failure(FailureNotice { key, reason: RunFailure::Aborted(e.to_string()) })
                        }
                    };
                }
                BuildClaim::InFlight(waiter) => {
                    info!("report already being built, waiting");
                    // Counted from the build's claim, not from this request
                    let deadline = waiter.started() + self.generation_timeout + OUTCOME_GRACE;
                    match tokio::time::timeout_at(deadline, waiter.wait()).await {
                        Ok(Some(Ok(entry))) => {
                            return Delivery::Report(ReportReceipt { entry, origin: DeliveryOrigin::Joined })
                        }
                        Ok(Some(Err(reason))) => return Delivery::Failure(FailureNotice { key, reason }),
                        Ok(None) => {
                            debug!("build went away without an outcome, retrying");
                            continue;
                        }
                        Err(_) => {
                            warn!("gave up waiting for the running build");
                            return Delivery::Failure(FailureNotice {
                                key,
                                reason: RunFailure::Timeout(self.generation_timeout),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn build(&self, guard: BuildGuard<BuildOutcome>) -> Delivery {
        let key = guard.key().clone();

        // A build may have finished between the miss and the claim
        if let Some(entry) = self.cache.lookup(&key).await {
            guard.publish(Ok(entry.clone()));
            return Delivery::Report(ReportReceipt { entry, origin: DeliveryOrigin::Cache });
        }

        let run_id = Uuid::new_v4();
        Span::current().record("run_id", tracing::field::display(run_id));
        info!("cache miss, building report");
        let started = Instant::now();
        let deadline = guard.started() + self.generation_timeout;

        let outcome: BuildOutcome =
            match tokio::time::timeout_at(deadline, self.pipeline.run(&key, self.cache.now())).await {
                Ok(Ok(artifact)) => {
                    let entry = self.cache.entry_for(&key, artifact);
                    if let Err(e) = self.cache.put(&entry).await {
                        error!("failed to cache report: {:#}", e);
                    }
                    Ok(entry)
                }
                Ok(Err(failure)) => Err(failure),
                Err(_) => Err(RunFailure::Timeout(self.generation_timeout)),
            };

        guard.publish(outcome.clone());

        match outcome {
            Ok(entry) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, uri = %entry.artifact.uri, "report built");
                Delivery::Report(ReportReceipt { entry, origin: DeliveryOrigin::Built })
            }
            Err(reason) => {
                error!(elapsed_ms = started.elapsed().as_millis() as u64, "report build failed: {}", reason);
                Delivery::Failure(FailureNotice { key, reason })
            }
        }
    }
}
