//! The functions service: side effects of platform events.
//!
//! ```ignore
//! let handlers = FunctionHandlers::new(InMemoryStats::new(), InMemoryNotifications::new());
//! handlers.register(&consumer).await?;
//! ```

mod error;
mod handlers;
mod notifications;
mod stats;

pub use error::StoreError;
pub use handlers::FunctionHandlers;
pub use notifications::{
    notification_id, InMemoryNotifications, Notification, NotificationKind, NotificationSink,
    UserNotifications, BROADCAST,
};
pub use stats::{InMemoryStats, InterestStats, ReviewStats, StatsStore};
