use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::classifier::{DeepClassifier, DeepVerdict, FastClassifier, FastVerdict};
use super::models::{ClassificationResult, ClassificationTask, Tier, TierDetail};
use crate::cache::{namespaces, MultiLevelCache};
use crate::infrastructure::error::{panic_message, ClassifierError};

const MIN_THRESHOLD: f64 = 0.1;
const MAX_THRESHOLD: f64 = 0.9;

/// 分层路由配置
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Fast verdicts below this confidence are escalated
    pub threshold: f64,
    /// Categories accepted from the fast path regardless of confidence
    pub obvious_spam: HashSet<String>,
    pub fast_accept_confidence: f64,
    /// Deep verdicts at or above this confidence replace the fast one outright
    pub deep_adopt_confidence: f64,
    pub deep_timeout: Duration,
    /// Operator ceiling for the share of strategic results, in percent
    pub strategic_ceiling_percent: f64,
    pub tune_step: f64,
    /// TTL for cached deep verdicts; `None` uses the namespace default
    pub cache_ttl: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.70,
            obvious_spam: ["spam", "phishing", "malware", "scam"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            fast_accept_confidence: 0.95,
            deep_adopt_confidence: 0.8,
            deep_timeout: Duration::from_secs(5),
            strategic_ceiling_percent: 20.0,
            tune_step: 0.05,
            cache_ttl: None,
        }
    }
}

/// Per-tier usage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierUsage {
    pub total: u64,
    pub fast: u64,
    pub geographic: u64,
    pub strategic: u64,
    pub errors: u64,
    pub deep_calls: u64,
    pub deep_failures: u64,
    pub cache_hits: u64,
}

impl TierUsage {
    pub fn count(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Fast => self.fast,
            Tier::Geographic => self.geographic,
            Tier::Strategic => self.strategic,
        }
    }

    pub fn percent(&self, tier: Tier) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.count(tier) as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    fast: AtomicU64,
    geographic: AtomicU64,
    strategic: AtomicU64,
    errors: AtomicU64,
    deep_calls: AtomicU64,
    deep_failures: AtomicU64,
    cache_hits: AtomicU64,
}

/// Routes each task through the cheapest tier that can decide it.
///
/// Only uncertain fast verdicts reach the deep classifier. The router is
/// shared by all workers; its threshold and counters are lock-free.
pub struct TieredRouter {
    config: RouterConfig,
    threshold_bits: AtomicU64,
    counters: TierCounters,
    cache: Option<Arc<MultiLevelCache>>,
}

impl TieredRouter {
    pub fn new(config: RouterConfig) -> Self {
        let threshold = config.threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        let obvious_spam = config.obvious_spam.iter().map(|c| c.to_lowercase()).collect();
        Self {
            config: RouterConfig {
                threshold,
                obvious_spam,
                ..config
            },
            threshold_bits: AtomicU64::new(threshold.to_bits()),
            counters: TierCounters::default(),
            cache: None,
        }
    }

    /// Keep deep verdicts in the shared cache, keyed by feature fingerprint
    pub fn with_cache(mut self, cache: Arc<MultiLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    /// Set the escalation threshold, clamped to [0.1, 0.9]. Returns the value applied.
    pub fn update_threshold(&self, threshold: f64) -> f64 {
        let clamped = if threshold.is_nan() {
            self.threshold()
        } else {
            threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
        };
        self.threshold_bits.store(clamped.to_bits(), Ordering::Relaxed);
        debug!(requested = threshold, applied = clamped, "escalation threshold updated");
        clamped
    }

    pub async fn classify(
        &self,
        task: &ClassificationTask,
        fast: &dyn FastClassifier,
        deep: Option<&dyn DeepClassifier>,
    ) -> ClassificationResult {
        let start = Instant::now();

        let classified = AssertUnwindSafe(fast.classify(&task.features)).catch_unwind().await;
        let mut verdict = match classified {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!(task_id = %task.id, classifier = fast.name(), error = %e, "fast classification failed");
                return self.failed(task, e, start);
            }
            Err(panic) => {
                let e = ClassifierError::Panicked {
                    message: panic_message(panic.as_ref()),
                };
                error!(task_id = %task.id, classifier = fast.name(), error = %e, "fast classifier panicked");
                return self.failed(task, e, start);
            }
        };
        verdict.confidence = unit_confidence(verdict.confidence);
        let confidence = verdict.confidence;

        if self.is_obvious(&verdict.category) || confidence >= self.config.fast_accept_confidence {
            return self.finish(task, verdict, TierDetail::Fast, start);
        }

        if let Some(source) = verdict.geo_signal {
            return self.finish(task, verdict, TierDetail::Geographic { source }, start);
        }

        let deep = match deep {
            Some(deep) if confidence < self.threshold() => deep,
            _ => return self.finish(task, verdict, TierDetail::Fast, start),
        };

        match self.deep_verdict(task, deep).await {
            Ok((deep_verdict, cached)) => self.integrate(task, verdict, deep_verdict, cached, start),
            Err(e) => {
                self.counters.deep_failures.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task.id, error = %e, "deep analysis failed, keeping fast verdict");
                self.finish(task, verdict, TierDetail::Fast, start)
            }
        }
    }

    /// Cache-aside deep call. The flag reports whether the verdict came from the cache.
    async fn deep_verdict(
        &self,
        task: &ClassificationTask,
        deep: &dyn DeepClassifier,
    ) -> Result<(DeepVerdict, bool), ClassifierError> {
        let key = self.cache.as_ref().map(|_| task.features.fingerprint());

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(verdict) = cache.get::<DeepVerdict>(namespaces::DEEP_VERDICTS, key).await {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task.id, "deep verdict served from cache");
                return Ok((verdict, true));
            }
        }

        self.counters.deep_calls.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.deep_timeout;
        let analysis = AssertUnwindSafe(deep.analyze(&task.features)).catch_unwind();
        let mut verdict = match tokio::time::timeout(timeout, analysis).await {
            Ok(Ok(result)) => result?,
            Ok(Err(panic)) => {
                return Err(ClassifierError::Panicked {
                    message: panic_message(panic.as_ref()),
                })
            }
            Err(_) => return Err(ClassifierError::timeout(deep.name(), timeout.as_millis() as u64)),
        };
        verdict.confidence = unit_confidence(verdict.confidence);

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Err(e) = cache
                .set(namespaces::DEEP_VERDICTS, key, &verdict, self.config.cache_ttl)
                .await
            {
                warn!(error = %e, "failed to cache deep verdict");
            }
        }

        Ok((verdict, false))
    }

    fn integrate(
        &self,
        task: &ClassificationTask,
        fast: FastVerdict,
        deep: DeepVerdict,
        cached: bool,
        start: Instant,
    ) -> ClassificationResult {
        let fast_confidence = unit_confidence(fast.confidence);
        let deep_confidence = unit_confidence(deep.confidence);

        let (category, confidence, blended) = if deep_confidence >= self.config.deep_adopt_confidence {
            (deep.category, deep_confidence, false)
        } else if deep_confidence > fast_confidence {
            (deep.category, (fast_confidence + deep_confidence) / 2.0, true)
        } else {
            (fast.category.clone(), (fast_confidence + deep_confidence) / 2.0, true)
        };

        self.counters.strategic.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %task.id, %category, confidence, blended, cached, "strategic verdict");

        ClassificationResult {
            task_id: task.id.clone(),
            category,
            confidence,
            detail: TierDetail::Strategic {
                fast_category: fast.category,
                fast_confidence,
                deep_confidence,
                blended,
                cached,
            },
            reason: deep.reason,
            duration: start.elapsed(),
            error: None,
        }
    }

    fn finish(
        &self,
        task: &ClassificationTask,
        verdict: FastVerdict,
        detail: TierDetail,
        start: Instant,
    ) -> ClassificationResult {
        let counter = match detail.tier() {
            Tier::Fast => &self.counters.fast,
            Tier::Geographic => &self.counters.geographic,
            Tier::Strategic => &self.counters.strategic,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        ClassificationResult {
            task_id: task.id.clone(),
            category: verdict.category,
            confidence: unit_confidence(verdict.confidence),
            detail,
            reason: verdict.reason,
            duration: start.elapsed(),
            error: None,
        }
    }

    fn failed(&self, task: &ClassificationTask, e: ClassifierError, start: Instant) -> ClassificationResult {
        self.record_error();
        ClassificationResult::error(&task.id, e.to_string(), start.elapsed())
    }

    /// Count an ERROR result produced outside `classify`
    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn is_obvious(&self, category: &str) -> bool {
        self.config.obvious_spam.contains(&category.to_lowercase())
    }

    /// Running counts per tier. ERROR results are counted apart from the tiers.
    pub fn tier_usage(&self) -> TierUsage {
        let fast = self.counters.fast.load(Ordering::Relaxed);
        let geographic = self.counters.geographic.load(Ordering::Relaxed);
        let strategic = self.counters.strategic.load(Ordering::Relaxed);
        TierUsage {
            total: fast + geographic + strategic,
            fast,
            geographic,
            strategic,
            errors: self.counters.errors.load(Ordering::Relaxed),
            deep_calls: self.counters.deep_calls.load(Ordering::Relaxed),
            deep_failures: self.counters.deep_failures.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    pub fn strategic_over_ceiling(&self) -> bool {
        self.tier_usage().percent(Tier::Strategic) > self.config.strategic_ceiling_percent
    }

    /// Lower the threshold by one step while strategic usage is over the ceiling.
    /// Returns the threshold in effect afterwards.
    pub fn auto_tune(&self) -> f64 {
        if !self.strategic_over_ceiling() {
            return self.threshold();
        }

        let previous = self.threshold();
        let applied = self.update_threshold(previous - self.config.tune_step);
        info!(
            previous,
            applied,
            strategic_percent = self.tier_usage().percent(Tier::Strategic),
            "strategic usage over ceiling, lowered escalation threshold"
        );
        applied
    }

    pub fn reset_usage(&self) {
        for counter in [
            &self.counters.fast,
            &self.counters.geographic,
            &self.counters.strategic,
            &self.counters.errors,
            &self.counters.deep_calls,
            &self.counters.deep_failures,
            &self.counters.cache_hits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// NaN and infinities carry no signal
fn unit_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::classification::models::EmailFeatures;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubFast {
        verdict: Result<FastVerdict, ClassifierError>,
    }

    impl StubFast {
        fn new(category: &str, confidence: f64) -> Self {
            Self {
                verdict: Ok(FastVerdict::new(category, confidence, "stub")),
            }
        }
    }

    #[async_trait]
    impl FastClassifier for StubFast {
        async fn classify(&self, _features: &EmailFeatures) -> Result<FastVerdict, ClassifierError> {
            self.verdict.clone()
        }
    }

    struct StubDeep {
        category: String,
        confidence: f64,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StubDeep {
        fn new(category: &str, confidence: f64) -> Self {
            Self {
                category: category.to_string(),
                confidence,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeepClassifier for StubDeep {
        async fn analyze(&self, _features: &EmailFeatures) -> Result<DeepVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(DeepVerdict::new(&self.category, self.confidence, "deep stub"))
        }
    }

    struct PanickingFast;

    #[async_trait]
    impl FastClassifier for PanickingFast {
        async fn classify(&self, _features: &EmailFeatures) -> Result<FastVerdict, ClassifierError> {
            panic!("rule table corrupted");
        }
    }

    struct PanickingDeep;

    #[async_trait]
    impl DeepClassifier for PanickingDeep {
        async fn analyze(&self, _features: &EmailFeatures) -> Result<DeepVerdict, ClassifierError> {
            panic!("model crashed");
        }
    }

    fn task() -> ClassificationTask {
        ClassificationTask::with_id("t-1", EmailFeatures::new("x@spam.test", "WIN NOW", "spam.test"))
    }

    #[tokio::test]
    async fn test_obvious_spam_stays_fast() {
        let router = TieredRouter::new(RouterConfig::default());
        let fast = StubFast::new("spam", 0.96);
        let deep = StubDeep::new("ham", 0.99);

        let result = router.classify(&task(), &fast, Some(&deep)).await;

        assert_eq!(result.tier(), Tier::Fast);
        assert_eq!(result.category, "spam");
        assert_eq!(deep.calls(), 0);
    }

    #[tokio::test]
    async fn test_uncertain_escalates_and_adopts_deep() {
        let router = TieredRouter::new(RouterConfig::default());
        let fast = StubFast::new("newsletter", 0.50);
        let deep = StubDeep::new("promotions", 0.90);

        let result = router.classify(&task(), &fast, Some(&deep)).await;

        assert_eq!(result.tier(), Tier::Strategic);
        assert_eq!(result.category, "promotions");
        assert_eq!(result.confidence, 0.90);
        assert_eq!(deep.calls(), 1);
        assert!(matches!(result.detail, TierDetail::Strategic { blended: false, .. }));
    }

    #[tokio::test]
    async fn test_low_deep_confidence_blends() {
        let router = TieredRouter::new(RouterConfig::default());

        let fast = StubFast::new("newsletter", 0.40);
        let deep = StubDeep::new("promotions", 0.60);
        let result = router.classify(&task(), &fast, Some(&deep)).await;
        assert_eq!(result.category, "promotions");
        assert!((result.confidence - 0.50).abs() < 1e-9);

        let fast = StubFast::new("newsletter", 0.65);
        let deep = StubDeep::new("promotions", 0.55);
        let result = router.classify(&task(), &fast, Some(&deep)).await;
        assert_eq!(result.category, "newsletter");
        assert!((result.confidence - 0.60).abs() < 1e-9);
        assert!(matches!(result.detail, TierDetail::Strategic { blended: true, .. }));
    }

    #[tokio::test]
    async fn test_geographic_signal_short_circuits() {
        let router = TieredRouter::new(RouterConfig::default());
        let ip = "203.0.113.9".parse().unwrap();
        let fast = StubFast {
            verdict: Ok(FastVerdict::new("suspicious", 0.3, "blocked region").with_geo_signal(ip)),
        };
        let deep = StubDeep::new("ham", 0.99);

        let result = router.classify(&task(), &fast, Some(&deep)).await;

        assert_eq!(result.detail, TierDetail::Geographic { source: ip });
        assert_eq!(deep.calls(), 0);
    }

    #[tokio::test]
    async fn test_deep_timeout_degrades_to_fast() {
        let router = TieredRouter::new(RouterConfig {
            deep_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let fast = StubFast::new("newsletter", 0.5);
        let mut deep = StubDeep::new("promotions", 0.9);
        deep.delay = Duration::from_millis(500);

        let result = router.classify(&task(), &fast, Some(&deep)).await;

        assert_eq!(result.tier(), Tier::Fast);
        assert_eq!(result.category, "newsletter");
        assert_eq!(router.tier_usage().deep_failures, 1);
    }

    #[tokio::test]
    async fn test_fast_failure_yields_error_result() {
        let router = TieredRouter::new(RouterConfig::default());
        let fast = StubFast {
            verdict: Err(ClassifierError::failed("fast", "model not loaded")),
        };

        let result = router.classify(&task(), &fast, None).await;

        assert!(result.is_error());
        assert_eq!(result.category, "ERROR");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(router.tier_usage().errors, 1);
        assert_eq!(router.tier_usage().total, 0);
    }

    #[tokio::test]
    async fn test_fast_panic_is_counted_as_error() {
        let router = TieredRouter::new(RouterConfig::default());

        let result = router.classify(&task(), &PanickingFast, None).await;

        assert!(result.is_error());
        assert!(result.reason.contains("rule table corrupted"));
        let usage = router.tier_usage();
        assert_eq!(usage.errors, 1);
        assert_eq!(usage.total, 0);
    }

    #[tokio::test]
    async fn test_deep_panic_keeps_fast_verdict() {
        let router = TieredRouter::new(RouterConfig::default());
        let fast = StubFast::new("newsletter", 0.5);

        let result = router.classify(&task(), &fast, Some(&PanickingDeep)).await;

        assert_eq!(result.tier(), Tier::Fast);
        assert_eq!(result.category, "newsletter");
        assert_eq!(router.tier_usage().deep_failures, 1);
    }

    #[tokio::test]
    async fn test_non_finite_confidence_reads_as_zero() {
        let router = TieredRouter::new(RouterConfig::default());

        let result = router.classify(&task(), &StubFast::new("newsletter", f64::NAN), None).await;
        assert_eq!(result.tier(), Tier::Fast);
        assert_eq!(result.confidence, 0.0);

        let fast = StubFast::new("newsletter", 0.5);
        let deep = StubDeep::new("promotions", f64::INFINITY);
        let result = router.classify(&task(), &fast, Some(&deep)).await;
        assert_eq!(result.tier(), Tier::Strategic);
        assert_eq!(result.category, "newsletter");
        assert!((result.confidence - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_deep_classifier_stays_fast() {
        let router = TieredRouter::new(RouterConfig::default());
        let fast = StubFast::new("newsletter", 0.2);

        let result = router.classify(&task(), &fast, None).await;
        assert_eq!(result.tier(), Tier::Fast);
    }

    #[test]
    fn test_threshold_clamping() {
        let router = TieredRouter::new(RouterConfig::default());
        assert_eq!(router.threshold(), 0.70);
        assert_eq!(router.update_threshold(0.01), 0.1);
        assert_eq!(router.update_threshold(1.5), 0.9);
        assert_eq!(router.update_threshold(0.5), 0.5);
        assert_eq!(router.threshold(), 0.5);
    }

    #[tokio::test]
    async fn test_cached_deep_verdict_skips_call() {
        let cache = Arc::new(MultiLevelCache::new(CacheConfig::default()));
        let router = TieredRouter::new(RouterConfig::default()).with_cache(cache.clone());
        let fast = StubFast::new("newsletter", 0.5);
        let deep = StubDeep::new("promotions", 0.9);

        let first = router.classify(&task(), &fast, Some(&deep)).await;
        let second = router.classify(&task(), &fast, Some(&deep)).await;

        assert_eq!(deep.calls(), 1);
        assert_eq!(first.category, second.category);
        assert!(matches!(second.detail, TierDetail::Strategic { cached: true, .. }));

        let usage = router.tier_usage();
        assert_eq!(usage.strategic, 2);
        assert_eq!(usage.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_auto_tune_lowers_threshold_over_ceiling() {
        let router = TieredRouter::new(RouterConfig {
            strategic_ceiling_percent: 10.0,
            tune_step: 0.1,
            ..Default::default()
        });
        let fast = StubFast::new("newsletter", 0.5);
        let deep = StubDeep::new("promotions", 0.9);

        router.classify(&task(), &fast, Some(&deep)).await;
        assert!(router.strategic_over_ceiling());

        let tuned = router.auto_tune();
        assert!((tuned - 0.6).abs() < 1e-9);

        router.reset_usage();
        assert!(!router.strategic_over_ceiling());
        assert_eq!(router.auto_tune(), tuned);
    }
}
