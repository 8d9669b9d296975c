//! Escalation: leveled notification and acknowledgment.
//!
//! - `notifier` -- notification port and the default tracing sink
//! - `coordinator` -- rule registry and the level-walking protocol

pub mod coordinator;
pub mod notifier;

pub use coordinator::{EscalationCoordinator, EscalationRequest, PendingEscalation};
pub use notifier::{BoxNotifier, Notification, Notifier, NotifyError, TracingNotifier};
