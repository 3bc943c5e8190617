//! # auditq core
//!
//! Job execution pipeline for long-running, failure-prone audit work.
//!
//! ## Overview
//!
//! - **Job store**: durable audit jobs with lease-guarded state transitions
//!   ([`store::JobStore`], Postgres and in-memory).
//! - **Queue backends**: one [`queue::QueueBackend`] contract, either the
//!   store itself ([`queue::EmbeddedQueue`]) or a reliable broker queue
//!   ([`queue::BrokerQueue`] over Redis lists or [`queue::MemoryBroker`]).
//! - **Workers**: claim, execute the external [`worker::AuditPipeline`],
//!   renew the lease, acknowledge or fail.
//! - **Progress events**: ordered per-audit timeline with long-poll reads.
//! - **Webhooks**: signed, retried, at-least-once notifications.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres stores and embedded migrations (sqlx)
//! - `redis`: the Redis broker
//! - `e2e`: integration tests against live Postgres / Redis
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use auditq_core::{
//!     clock::SystemClock,
//!     events::{MemoryEventStore, ProgressRecorder},
//!     ids::{AuditId, TenantId},
//!     queue::EmbeddedQueue,
//!     service::JobService,
//!     store::MemoryJobStore,
//!     webhook::{MemoryWebhookStore, WebhookNotifier},
//! };
//!
//! # async fn demo() -> auditq_core::Result<()> {
//! let clock = SystemClock::shared();
//! let store = Arc::new(MemoryJobStore::new(clock.clone()));
//! let queue = Arc::new(EmbeddedQueue::new(store, Duration::from_secs(1)));
//! let recorder = ProgressRecorder::new(Arc::new(MemoryEventStore::new(clock.clone())));
//! let notifier = WebhookNotifier::new(
//!     Arc::new(MemoryWebhookStore::new(clock.clone())),
//!     clock,
//!     5,
//! );
//! let service = JobService::new(queue, recorder, notifier, 3);
//!
//! let enqueued = service
//!     .enqueue(TenantId::new(), AuditId::new(), serde_json::json!({}), "order-42", None)
//!     .await?;
//! assert!(enqueued.created);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
#[cfg(feature = "database")]
pub mod db;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod store;
pub mod webhook;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{PipelineConfig, QueueBackendKind};
pub use error::{DeliveryError, ExecutionError, PipelineError, Result};
pub use ids::{AuditId, DeliveryId, JobId, TenantId, WebhookId};
pub use job::{AuditJob, Enqueued, FailOutcome, JobStats, JobStatus, NewJob};
pub use runtime::PipelineRuntime;
pub use service::JobService;
pub use worker::{AuditContext, AuditPipeline, JobOutcome, Worker};
