//! Status Notification Module
//!
//! Fire-and-forget delivery of step status changes.
//!
//! # Components
//!
//! - [`batch`]: Generic background batching primitive
//! - [`publisher`]: Step notification record and publishers

pub mod batch;
pub mod publisher;

pub use batch::{BatchConfig, BatchNotifier, NotifierClosed, Notify};
pub use publisher::{
    HttpPublisher, LogPublisher, NotificationPublisher, PublishError, StepNotification,
    StepPublisher,
};

/// Notifier carrying step notifications, one producer batch per item.
pub type StepNotifier = BatchNotifier<Vec<StepNotification>>;

/// Starts a step notifier publishing through `publisher`.
pub fn start_step_notifier<P: NotificationPublisher>(
    publisher: P,
    config: BatchConfig,
) -> StepNotifier {
    BatchNotifier::start(StepPublisher::new(publisher), config)
}
