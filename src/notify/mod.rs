//! Webhook mirroring of ledger events

mod emitter;
mod template;
mod webhook;

pub use emitter::{WebhookNotifier, event_kind, event_vars};
pub use template::{EventKind, MAX_TEMPLATE_DEPTH, TemplateError, TemplateSet};
pub use webhook::{DeliveryError, DeliveryOutcome, HttpWebhook, WebhookSink, validate_url};
