//! Notification delivery.
//!
//! Inbound domain events become notifications with one delivery record per
//! channel. The [`Dispatcher`] drives each record through the
//! [`PreferenceGate`], the channel's [`DeliveryProvider`] and the
//! [`RetryScheduler`], publishing a [`LifecycleEvent`] on every terminal
//! transition.
//!
//! # Example
//!
//! ```ignore
//! use herald::notification::{Dispatcher, DispatcherParts, InMemoryQueue};
//!
//! let (queue, receiver) = InMemoryQueue::new();
//! let dispatcher = Arc::new(Dispatcher::new(parts, retry_config, dispatcher_config));
//! dispatcher.submit(&event).await?;
//! ```

pub mod cache;
pub mod dispatcher;
pub mod events;
pub mod gate;
pub mod preferences;
pub mod providers;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod worker;

pub use cache::PreferenceCache;
pub use dispatcher::{
    DeliveryStats, DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherParts, DropReason,
    RequeueReason,
};
pub use events::{DomainEvent, LifecycleEvent, LifecycleEventType, Recipient};
pub use gate::{DenyReason, FrequencyWindow, GateDecision, PreferenceGate};
pub use preferences::PreferenceService;
pub use providers::{
    DeliveryOutcome, DeliveryProvider, EmailConfig, EmailProvider, FailureClass, OutcomeStatus,
    ProviderRegistry, PushConfig, PushProvider, SmsConfig, SmsProvider,
};
pub use queue::{BroadcastPublisher, DispatchTask, InMemoryQueue, LifecyclePublisher, RetryQueue};
pub use retry::{RetryConfig, RetryScheduler};
pub use worker::WorkerPool;
