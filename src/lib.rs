//! Hyperliquid feed collector and watchdog monitor.
//!
//! Two independently deployable processes built from this library:
//! - `hl-collector` streams exchange market data over a persistent
//!   WebSocket, appends every message to a per-day raw log and a shared
//!   feed file, publishes a heartbeat snapshot, and prunes aged logs.
//! - `hl-monitor` watches the heartbeat file and the OS process table,
//!   classifies collector health through a hysteresis state machine, and
//!   delivers alerts.
//!
//! The only coupling between the two is the heartbeat file contract.

pub mod buffer;
pub mod clock;
pub mod collector;
pub mod config;
pub mod errors;
pub mod heartbeat;
pub mod hyperliquid;
pub mod monitor;
pub mod notify;
pub mod retention;

pub use buffer::IngestBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::CollectorService;
pub use config::{Config, MonitorConfig};
pub use errors::{CollectorError, Result};
pub use heartbeat::{HeartbeatPublisher, HeartbeatRead, HeartbeatSnapshot, LifecycleState};
pub use hyperliquid::{ConnectionStatus, FeedRecord, StreamClient, SubscribeRequest};
pub use monitor::{HealthMonitor, HealthStatus, MonitorState};
pub use notify::{Alert, Notifier, Severity, WebhookNotifier};
pub use retention::RetentionManager;
