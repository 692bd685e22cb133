//! Application services: the reconciliation loop and everything it drives.

pub mod ack_consumer;
pub mod controller_daemon;
pub mod delivery_tracker;
pub mod desired_state;
pub mod job_identity;
pub mod key_locks;
pub mod reconciler;
pub mod spec_notifier;
pub mod version_codec;

pub use ack_consumer::{AckConsumer, AckConsumerConfig};
pub use controller_daemon::{
    ControllerDaemon, ControllerDaemonConfig, ControllerEvent, DaemonHandle, DaemonStatus,
};
pub use delivery_tracker::{AckOutcome, DeliveryTracker, TrackerConfig, TrackerStats};
pub use desired_state::{
    compute_desired, CatalogSnapshot, DesiredJob, DesiredState, DesiredStateConfig,
};
pub use key_locks::KeyedLocks;
pub use reconciler::{Reconciler, ReconcilerConfig, TickReport};
pub use spec_notifier::{Publication, SpecNotifier};
