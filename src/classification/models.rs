use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::content_hash;

/// Category assigned to results that could not be classified
pub const ERROR_CATEGORY: &str = "ERROR";

/// 邮件特征
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmailFeatures {
    pub sender: String,
    pub subject: String,
    pub domain: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
}

impl EmailFeatures {
    pub fn new(sender: impl Into<String>, subject: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Stable SHA-256 over every field, used as the deep-verdict cache key
    pub fn fingerprint(&self) -> String {
        let ip = self.source_ip.map(|ip| ip.to_string()).unwrap_or_default();
        let mut parts = vec![
            self.sender.as_str(),
            self.subject.as_str(),
            self.domain.as_str(),
            ip.as_str(),
        ];
        for (name, value) in &self.headers {
            parts.push(name.as_str());
            parts.push(value.as_str());
        }
        content_hash(parts)
    }
}

/// 分类任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTask {
    pub id: String,
    pub features: EmailFeatures,
    pub submitted_at: DateTime<Utc>,
}

impl ClassificationTask {
    pub fn new(features: EmailFeatures) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), features)
    }

    pub fn with_id(id: impl Into<String>, features: EmailFeatures) -> Self {
        Self {
            id: id.into(),
            features,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Fast,
    Geographic,
    Strategic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Geographic => "geographic",
            Tier::Strategic => "strategic",
        }
    }
}

/// Processing depth reached for a task, with the data relevant to that depth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum TierDetail {
    Fast,
    Geographic {
        source: IpAddr,
    },
    Strategic {
        fast_category: String,
        fast_confidence: f64,
        deep_confidence: f64,
        /// false when the deep verdict was adopted outright
        blended: bool,
        cached: bool,
    },
}

impl TierDetail {
    pub fn tier(&self) -> Tier {
        match self {
            TierDetail::Fast => Tier::Fast,
            TierDetail::Geographic { .. } => Tier::Geographic,
            TierDetail::Strategic { .. } => Tier::Strategic,
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub task_id: String,
    pub category: String,
    pub confidence: f64,
    pub detail: TierDetail,
    pub reason: String,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ClassificationResult {
    /// An ERROR-tagged result: category `ERROR`, zero confidence, fast tier
    pub fn error(task_id: impl Into<String>, reason: impl Into<String>, duration: Duration) -> Self {
        let reason = reason.into();
        Self {
            task_id: task_id.into(),
            category: ERROR_CATEGORY.to_string(),
            confidence: 0.0,
            detail: TierDetail::Fast,
            reason: reason.clone(),
            duration,
            error: Some(reason),
        }
    }

    pub fn tier(&self) -> Tier {
        self.detail.tier()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
