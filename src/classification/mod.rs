pub mod classifier;
pub mod models;
pub mod router;

pub use classifier::{DeepClassifier, DeepVerdict, FastClassifier, FastVerdict};
pub use models::{
    ClassificationResult, ClassificationTask, EmailFeatures, Tier, TierDetail, ERROR_CATEGORY,
};
pub use router::{RouterConfig, TierUsage, TieredRouter};
