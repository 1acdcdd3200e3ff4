//! Scoring collaborator trait and retry policy.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use jobs_core::{EvaluationItem, JobConfiguration, JobMetrics};

/// Score for one evaluation item, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub rationale: Option<String>,
}

impl Score {
    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Errors a scorer may report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    /// Worth retrying: timeouts, rate limits, unavailable upstream.
    #[error("transient scoring error: {0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("permanent scoring error: {0}")]
    Permanent(String),
}

/// Future type for async scorers.
pub type ScoreFuture = Pin<Box<dyn Future<Output = Result<Score, ScoreError>> + Send>>;

/// Scores one evaluation item against the job configuration.
///
/// Implementations wrap the external comparison service; the worker treats
/// them as opaque.
pub trait Scorer: Send + Sync + 'static {
    fn score(&self, item: &EvaluationItem, configuration: &JobConfiguration) -> ScoreFuture;
}

impl<S: Scorer + ?Sized> Scorer for Arc<S> {
    fn score(&self, item: &EvaluationItem, configuration: &JobConfiguration) -> ScoreFuture {
        (**self).score(item, configuration)
    }
}

/// A simple function-based scorer.
pub struct FnScorer<F>
where
    F: Fn(&EvaluationItem, &JobConfiguration) -> ScoreFuture + Send + Sync + 'static,
{
    scorer: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&EvaluationItem, &JobConfiguration) -> ScoreFuture + Send + Sync + 'static,
{
    /// Create a new function-based scorer.
    pub fn new(scorer: F) -> Self {
        Self { scorer }
    }
}

impl<F> Scorer for FnScorer<F>
where
    F: Fn(&EvaluationItem, &JobConfiguration) -> ScoreFuture + Send + Sync + 'static,
{
    fn score(&self, item: &EvaluationItem, configuration: &JobConfiguration) -> ScoreFuture {
        (self.scorer)(item, configuration)
    }
}

/// Token-overlap (Jaccard) similarity between expected and actual responses.
///
/// Stands in for the external comparison service in local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimilarityScorer;

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SimilarityScorer {
    pub fn similarity(expected: &str, actual: &str) -> f64 {
        let expected = tokens(expected);
        let actual = tokens(actual);
        if expected.is_empty() && actual.is_empty() {
            return 1.0;
        }
        let shared = expected.intersection(&actual).count() as f64;
        let union = expected.union(&actual).count() as f64;
        shared / union
    }
}

impl Scorer for SimilarityScorer {
    fn score(&self, item: &EvaluationItem, _configuration: &JobConfiguration) -> ScoreFuture {
        let score = match &item.actual_response {
            Some(actual) => Score::new(Self::similarity(&item.expected_response, actual))
                .with_rationale("token overlap with expected response"),
            None => Score::new(0.0).with_rationale("no actual response supplied"),
        };
        Box::pin(async move { Ok(score) })
    }
}

/// Exponential backoff policy: `base_delay * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Why an item could not be scored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringFailure {
    #[error("scoring failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("{0}")]
    Permanent(String),
}

/// Score one item, retrying transient failures and timeouts with backoff.
pub async fn score_with_retry(
    scorer: &dyn Scorer,
    item: &EvaluationItem,
    configuration: &JobConfiguration,
    policy: &RetryPolicy,
    timeout: Duration,
    metrics: &dyn JobMetrics,
) -> Result<Score, ScoringFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let last_error = match tokio::time::timeout(timeout, scorer.score(item, configuration)).await
        {
            Ok(Ok(score)) => return Ok(score),
            Ok(Err(ScoreError::Permanent(reason))) => return Err(ScoringFailure::Permanent(reason)),
            Ok(Err(ScoreError::Transient(reason))) => reason,
            Err(_) => format!("scoring timed out after {timeout:?}"),
        };

        if attempt >= max_attempts {
            return Err(ScoringFailure::Exhausted {
                attempts: attempt,
                last_error,
            });
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(attempt, ?delay, "Retrying item after transient failure: {}", last_error);
        metrics.item_retried();
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use jobs_core::{CountingMetrics, NoopMetrics};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn similarity_is_token_overlap() {
        assert!((SimilarityScorer::similarity("Paris", "paris") - 1.0).abs() < f64::EPSILON);
        assert!((SimilarityScorer::similarity("the cat", "the dog") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(SimilarityScorer::similarity("a", ""), 0.0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let scorer = FnScorer::new(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < 2 {
                    Err(ScoreError::Transient("busy".into()))
                } else {
                    Ok(Score::new(0.9))
                }
            })
        });
        let metrics = CountingMetrics::default();
        let item = EvaluationItem::new("q", "a");
        let config = JobConfiguration::inline(vec![item.clone()]);

        let score = score_with_retry(
            &scorer,
            &item,
            &config,
            &fast_policy(3),
            Duration::from_secs(1),
            &metrics,
        )
        .await
        .unwrap();
        assert_eq!(score.value, 0.9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(CountingMetrics::get(&metrics.retried), 2);
    }

    #[tokio::test]
    async fn exhaustion_and_permanent_failures() {
        let item = EvaluationItem::new("q", "a");
        let config = JobConfiguration::inline(vec![item.clone()]);

        let always_busy = FnScorer::new(|_, _| {
            Box::pin(async { Err(ScoreError::Transient("busy".into())) })
        });
        let err = score_with_retry(
            &always_busy,
            &item,
            &config,
            &fast_policy(2),
            Duration::from_secs(1),
            &NoopMetrics,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScoringFailure::Exhausted { attempts: 2, .. }));

        let broken = FnScorer::new(|_, _| {
            Box::pin(async { Err(ScoreError::Permanent("bad prompt".into())) })
        });
        let err = score_with_retry(
            &broken,
            &item,
            &config,
            &fast_policy(5),
            Duration::from_secs(1),
            &NoopMetrics,
        )
        .await
        .unwrap_err();
        assert_eq!(err, ScoringFailure::Permanent("bad prompt".into()));
    }

    #[tokio::test]
    async fn slow_scorer_times_out() {
        let item = EvaluationItem::new("q", "a");
        let config = JobConfiguration::inline(vec![item.clone()]);
        let slow = FnScorer::new(|_, _| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Score::new(1.0))
            })
        });

        let err = score_with_retry(
            &slow,
            &item,
            &config,
            &fast_policy(1),
            Duration::from_millis(10),
            &NoopMetrics,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScoringFailure::Exhausted { attempts: 1, .. }));
    }
}
