//! User-facing notifications.
//!
//! - [`NotificationPreferences`]: parse-or-default preference handling
//! - [`PushTransport`]: delivery backend seam, with an HTTP implementation
//! - [`NotificationDispatcher`]: subscription, gating and click routing

mod dispatcher;
mod preferences;
mod transport;

pub use dispatcher::{
  route_click, BackgroundSyncStatus, NotificationDispatcher, NotificationStatus, SendOutcome,
};
pub use preferences::{ClockTime, Frequency, NotificationPreferences, QuietHours};
pub use transport::{
  EndpointSubscription, HttpPushTransport, NotificationAction, PushEndpoints, PushTransport,
  QueuedNotification, SubscriptionApi, TransportStats, Urgency,
};

#[cfg(test)]
pub(crate) use transport::fake;
