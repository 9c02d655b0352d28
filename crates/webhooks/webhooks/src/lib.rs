//! # CityForge Webhooks
//!
//! Outbound webhook delivery for CityForge:
//! - Endpoint registry with per-endpoint subscriptions and retry policies
//! - Concurrent fan-out of events to subscribed endpoints
//! - HMAC-SHA256 payload signing (`X-Signature: sha256=<hex>`)
//! - Durable delivery ledger with a retry queue and periodic sweep
//!
//! ## Example
//!
//! ```rust,no_run
//! use cityforge_events::EventType;
//! use cityforge_webhooks::{NewEndpoint, WebhookConfig, WebhookSystem};
//!
//! # async fn run() -> cityforge_webhooks::WebhookResult<()> {
//! let system = WebhookSystem::new(WebhookConfig::default().enabled(true))?;
//!
//! system
//!     .add_endpoint(
//!         NewEndpoint::new("crm", "https://crm.example.com/hooks")
//!             .secret("whsec_123")
//!             .events([EventType::UserRegistered]),
//!     )
//!     .await?;
//!
//! system.start().await;
//! system
//!     .create_and_send_event(EventType::UserRegistered, serde_json::json!({"user_id": 42}))
//!     .await;
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod delivery;
mod endpoint;
mod engine;
mod error;
mod queue;
mod receiver;
mod registry;
mod retry;
mod scheduler;
mod signature;
mod storage;
mod system;

pub use delivery::{Delivery, DeliveryError, DeliveryOutcome, DeliveryStatus, ResponseInfo, truncate_body};
pub use endpoint::{
    DEFAULT_TIMEOUT_SECONDS, Endpoint, EndpointUpdate, NewEndpoint, RESERVED_HEADERS, is_reserved_header,
};
pub use engine::{
    DeliveryEngine, DeliveryEngineBuilder, DispatchReport, PermanentFailureHook, SweepReport, delivery_headers,
};
pub use error::{WebhookError, WebhookResult};
pub use queue::{QueuedDelivery, RetryQueue};
pub use receiver::WebhookReceiver;
pub use registry::EndpointRegistry;
pub use retry::{MAX_BACKOFF_SECONDS, RetryPolicy};
pub use scheduler::{RetryScheduler, SchedulerHandle};
pub use signature::{SIGNATURE_PREFIX, WebhookSigner, sign_payload};
pub use storage::{InMemoryLedger, WebhookLedger};
pub use system::{WebhookConfig, WebhookSystem};
