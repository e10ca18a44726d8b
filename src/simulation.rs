//! Synthetic workload and stand-in classifiers for the load-simulation binary.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::classification::{
    ClassificationTask, DeepClassifier, DeepVerdict, EmailFeatures, FastClassifier, FastVerdict,
};
use crate::infrastructure::error::ClassifierError;

/// Documentation range treated as a high-risk sending region
const RISKY_NETWORK: [u8; 3] = [203, 0, 113];

/// Rule-of-thumb fast classifier over subject and source address
#[derive(Debug, Default)]
pub struct KeywordClassifier;

#[async_trait]
impl FastClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, features: &EmailFeatures) -> Result<FastVerdict, ClassifierError> {
        let subject = features.subject.to_lowercase();

        if subject.contains("winner") || subject.contains("free money") {
            return Ok(FastVerdict::new("spam", 0.97, "spam keyword in subject"));
        }

        if let Some(IpAddr::V4(ip)) = features.source_ip {
            if ip.octets()[..3] == RISKY_NETWORK {
                return Ok(FastVerdict::new("suspicious", 0.6, "sender in high-risk network")
                    .with_geo_signal(IpAddr::V4(ip)));
            }
        }

        if subject.ends_with('?') {
            return Ok(FastVerdict::new("unknown", 0.5, "no decisive signal"));
        }

        Ok(FastVerdict::new("ham", 0.9, "regular correspondence"))
    }
}

/// Deep classifier stand-in with a fixed latency
#[derive(Debug)]
pub struct SimulatedDeepClassifier {
    latency: Duration,
    calls: AtomicU64,
}

impl SimulatedDeepClassifier {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeepClassifier for SimulatedDeepClassifier {
    fn name(&self) -> &str {
        "simulated-deep"
    }

    async fn analyze(&self, features: &EmailFeatures) -> Result<DeepVerdict, ClassifierError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;

        let category = if features.sender.len() % 2 == 0 {
            "promotions"
        } else {
            "personal"
        };
        Ok(DeepVerdict::new(category, 0.85, "simulated content analysis"))
    }
}

/// Generates a reproducible mix of spam, uncertain, geographic and ordinary mail
pub struct WorkloadGenerator {
    rng: StdRng,
    spam_ratio: f64,
    uncertain_ratio: f64,
    geo_ratio: f64,
}

impl WorkloadGenerator {
    pub fn new(seed: Option<u64>, spam_ratio: f64, uncertain_ratio: f64) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            spam_ratio: spam_ratio.clamp(0.0, 1.0),
            uncertain_ratio: uncertain_ratio.clamp(0.0, 1.0),
            geo_ratio: 0.05,
        }
    }

    pub fn next_task(&mut self, index: usize) -> ClassificationTask {
        let roll: f64 = self.rng.gen();
        let spam_cut = self.spam_ratio;
        let uncertain_cut = spam_cut + self.uncertain_ratio;
        let geo_cut = uncertain_cut + self.geo_ratio;

        let features = if roll < spam_cut {
            EmailFeatures::new(
                format!("promo{}@lottery.test", self.rng.gen_range(0..1000)),
                "You are a WINNER",
                "lottery.test",
            )
        } else if roll < uncertain_cut {
            // a small sender pool so repeated deep verdicts come from the cache
            let sender = self.rng.gen_range(0..50);
            EmailFeatures::new(format!("contact{}@vendor.test", sender), "Quick question?", "vendor.test")
        } else if roll < geo_cut {
            let host = self.rng.gen_range(1..255);
            let ip = Ipv4Addr::new(RISKY_NETWORK[0], RISKY_NETWORK[1], RISKY_NETWORK[2], host);
            EmailFeatures::new(format!("billing{}@invoices.test", host), "Invoice attached", "invoices.test")
                .with_source_ip(IpAddr::V4(ip))
        } else {
            EmailFeatures::new(format!("colleague{}@example.com", index % 200), "Weekly sync notes", "example.com")
                .with_header("X-Priority", "3")
        };

        ClassificationTask::with_id(format!("sim-{}", index), features)
    }

    pub fn generate(&mut self, count: usize) -> Vec<ClassificationTask> {
        (0..count).map(|index| self.next_task(index)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyword_classifier_rules() {
        let fast = KeywordClassifier;

        let spam = EmailFeatures::new("a@b.test", "FREE MONEY inside", "b.test");
        assert_eq!(fast.classify(&spam).await.unwrap().category, "spam");

        let ip: IpAddr = "203.0.113.40".parse().unwrap();
        let geo = EmailFeatures::new("a@b.test", "Invoice", "b.test").with_source_ip(ip);
        assert_eq!(fast.classify(&geo).await.unwrap().geo_signal, Some(ip));

        let unsure = EmailFeatures::new("a@b.test", "Lunch?", "b.test");
        assert_eq!(fast.classify(&unsure).await.unwrap().confidence, 0.5);

        let ham = EmailFeatures::new("a@b.test", "Notes", "b.test");
        assert_eq!(fast.classify(&ham).await.unwrap().category, "ham");
    }

    #[test]
    fn test_workload_is_reproducible() {
        let first: Vec<String> = WorkloadGenerator::new(Some(7), 0.2, 0.1)
            .generate(50)
            .into_iter()
            .map(|t| t.features.subject)
            .collect();
        let second: Vec<String> = WorkloadGenerator::new(Some(7), 0.2, 0.1)
            .generate(50)
            .into_iter()
            .map(|t| t.features.subject)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_workload_respects_zero_ratios() {
        let tasks = WorkloadGenerator::new(Some(1), 0.0, 0.0).generate(100);
        assert!(tasks.iter().all(|t| !t.features.subject.contains("WINNER")));
        assert!(tasks.iter().all(|t| !t.features.subject.ends_with('?')));
    }
}
