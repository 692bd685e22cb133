pub mod config;
pub mod feature_set;
pub mod job;
pub mod notification;
pub mod selector;
pub mod source;
pub mod store;
pub mod version;

pub use config::{
    ApiConfig, CatalogConfig, Config, ControllerConfig, DatabaseConfig, JobManagerConfig,
    LoggingConfig, RunnerKind,
};
pub use feature_set::{
    FeatureSet, FeatureSetMeta, FeatureSetRef, FeatureSetSpec, FeatureSetStatus, FieldSpec,
    ValueType,
};
pub use job::{DeliveryState, FeatureSetDeliveryStatus, Job, JobStatus, VERSION_LABEL};
pub use notification::{FeatureSetSpecAck, SpecUpdate};
pub use selector::FeatureSetSelector;
pub use source::{KafkaSourceConfig, Source, SourceType};
pub use store::{Store, StoreType, Subscription};
pub use version::ControllerVersion;
