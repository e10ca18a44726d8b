use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::EmailFeatures;
use crate::infrastructure::error::ClassifierError;

/// Verdict from the cheap first-pass classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastVerdict {
    pub category: String,
    pub confidence: f64,
    pub reason: String,
    /// Set when the verdict was driven by the sender's network location
    pub geo_signal: Option<IpAddr>,
}

impl FastVerdict {
    pub fn new(category: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            confidence,
            reason: reason.into(),
            geo_signal: None,
        }
    }

    pub fn with_geo_signal(mut self, ip: IpAddr) -> Self {
        self.geo_signal = Some(ip);
        self
    }
}

/// Verdict from the expensive escalation path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepVerdict {
    pub category: String,
    pub confidence: f64,
    pub reason: String,
}

impl DeepVerdict {
    pub fn new(category: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            confidence,
            reason: reason.into(),
        }
    }
}

/// First-pass classifier. Must not block on network I/O.
#[async_trait]
pub trait FastClassifier: Send + Sync {
    fn name(&self) -> &str {
        "fast"
    }

    async fn classify(&self, features: &EmailFeatures) -> Result<FastVerdict, ClassifierError>;
}

/// Slow, expensive analysis. The router bounds every call with a timeout.
#[async_trait]
pub trait DeepClassifier: Send + Sync {
    fn name(&self) -> &str {
        "deep"
    }

    async fn analyze(&self, features: &EmailFeatures) -> Result<DeepVerdict, ClassifierError>;
}
