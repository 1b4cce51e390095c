pub mod channels;
pub mod dispatcher;
pub mod event;
pub mod notifier;

pub use channels::{LogNotifier, WebhookConfig, WebhookNotifier};
pub use dispatcher::{
    DispatchQueue, DispatchReport, Dispatcher, EnqueueOutcome, QueueError, RetryPolicy,
};
pub use event::{AlertEvent, EventState, NotificationBatch};
pub use notifier::{DeliveryError, Notifier, PartialDelivery};
