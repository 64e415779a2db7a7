//! Webhook notification emitter
//!
//! Ledger observer that mirrors lifecycle events to a webhook. Delivery runs
//! on a spawned task so the ledger operation that produced the event never
//! waits on the network; its outcome is only logged.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::template::{EventKind, TemplateSet};
use super::webhook::{DeliveryOutcome, WebhookSink};
use crate::WEBHOOK_TARGET;
use crate::ledger::{
    AccountName, LedgerEvent, LedgerObserver, NEVER, WarningRecord, WarningStore, format_duration, format_timestamp,
};

/// Observer that renders templates and posts them to a webhook sink
pub struct WebhookNotifier {
    templates: Arc<TemplateSet>,
    sink: Arc<dyn WebhookSink>,
    counts: Option<Weak<WarningStore>>,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(templates: Arc<TemplateSet>, sink: Arc<dyn WebhookSink>) -> Self {
        Self {
            templates,
            sink,
            counts: None,
        }
    }

    /// Fill `{count}`, `{remainingCount}` and `{warningCount}` from the store
    #[must_use]
    pub fn with_counts(mut self, store: &Arc<WarningStore>) -> Self {
        self.counts = Some(Arc::downgrade(store));
        self
    }
}

/// Which template an event uses
#[must_use]
pub fn event_kind(event: &LedgerEvent) -> EventKind {
    match event {
        LedgerEvent::Added { .. } => EventKind::Add,
        LedgerEvent::Removed { .. } => EventKind::Remove,
        LedgerEvent::Edited { .. } => EventKind::Edit,
        LedgerEvent::Expired { .. } => EventKind::Expire,
        LedgerEvent::Punished { .. } => EventKind::Punishment,
    }
}

fn record_vars(record: &WarningRecord) -> Vec<(&'static str, String)> {
    vec![
        ("id", record.id.to_string()),
        ("player", record.account.to_string()),
        ("reason", record.reason.clone()),
        ("source", record.source.clone()),
    ]
}

/// "Never" or "until 2 days (2024-01-03 10:00:00)"
fn remaining_expiration(record: &WarningRecord) -> String {
    match record.expires_at {
        None => NEVER.to_string(),
        Some(at) => format!(
            "until {} ({})",
            format_duration((at - Utc::now()).num_seconds()),
            format_timestamp(at)
        ),
    }
}

/// Template variables available for an event
#[must_use]
pub fn event_vars(event: &LedgerEvent) -> Vec<(&'static str, String)> {
    match event {
        LedgerEvent::Added { record } => {
            let mut vars = record_vars(record);
            vars.push(("timestamp", format_timestamp(record.created_at)));
            vars.push(("expiration", remaining_expiration(record)));
            vars
        }
        LedgerEvent::Removed { record } => {
            let mut vars = record_vars(record);
            vars.push(("timestamp", format_timestamp(record.created_at)));
            vars
        }
        LedgerEvent::Expired { record } => {
            let mut vars = record_vars(record);
            vars.push(("expirationDate", record.expiration_label()));
            vars
        }
        LedgerEvent::Edited {
            record,
            field,
            old,
            new,
        } => {
            let mut vars = record_vars(record);
            vars.push(("editType", field.to_string()));
            vars.push(("oldValue", old.clone()));
            vars.push(("newValue", new.clone()));
            vars
        }
        LedgerEvent::Punished {
            account,
            sanction,
            issuer,
            reason,
            warning_count,
        } => {
            let mut vars = vec![
                ("player", account.to_string()),
                ("punishmentType", sanction.to_string()),
                ("issuerName", issuer.clone()),
                ("reason", reason.clone()),
            ];
            if let Some(count) = warning_count {
                vars.push(("warningCount", count.to_string()));
            }
            vars
        }
    }
}

/// Name of the count variable an event kind carries
fn count_var(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Add => "count",
        EventKind::Remove | EventKind::Expire => "remainingCount",
        EventKind::Punishment => "warningCount",
        EventKind::Edit => "",
    }
}

async fn fill_count(
    store: Option<Arc<WarningStore>>,
    account: &AccountName,
    kind: EventKind,
    vars: &mut Vec<(&'static str, String)>,
) {
    let name = count_var(kind);
    if name.is_empty() || vars.iter().any(|(key, _)| *key == name) {
        return;
    }
    let count = match store {
        Some(store) => match store.get_warning_count(account).await {
            Ok(count) => count,
            Err(e) => {
                debug!(target: WEBHOOK_TARGET, account = %account, "Could not read warning count for webhook: {e}");
                0
            }
        },
        None => 0,
    };
    vars.push((name, count.to_string()));
}

impl LedgerObserver for WebhookNotifier {
    fn on_event(&self, event: &LedgerEvent) -> Result<(), crate::Error> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let kind = event_kind(event);
        let account = event.account().clone();
        let mut vars = event_vars(event);
        let templates = Arc::clone(&self.templates);
        let sink = Arc::clone(&self.sink);
        let store = self.counts.as_ref().and_then(Weak::upgrade);
        let delivery = Uuid::new_v4();

        runtime.spawn(async move {
            fill_count(store, &account, kind, &mut vars).await;
            let payload = match templates.render(kind, &vars) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!(target: WEBHOOK_TARGET, "No {kind} template, event not mirrored");
                    return;
                }
                Err(e) => {
                    warn!(target: WEBHOOK_TARGET, "Failed to render {kind} template: {e}");
                    return;
                }
            };

            match sink.deliver(payload).await {
                Ok(DeliveryOutcome::Delivered) => {
                    debug!(target: WEBHOOK_TARGET, %delivery, "Webhook {kind} sent");
                }
                Ok(DeliveryOutcome::Transient(status)) => {
                    info!(target: WEBHOOK_TARGET, %delivery, status, "Webhook {kind} temporary error");
                }
                Ok(DeliveryOutcome::Permanent(status)) => {
                    warn!(target: WEBHOOK_TARGET, %delivery, status, "Webhook {kind} failed");
                }
                Err(e) => warn!(target: WEBHOOK_TARGET, %delivery, "Webhook {kind} request failed: {e}"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::ledger::{MemoryBackend, ObserverRegistry, Sanction};
    use crate::notify::webhook::MockWebhookSink;

    fn templates() -> Arc<TemplateSet> {
        Arc::new(TemplateSet::from_templates(HashMap::from([
            (EventKind::Add, json!({"content": "{player} warned (#{id}) for {reason}, total {count}"})),
            (EventKind::Edit, json!({"content": "{editType}: {oldValue} -> {newValue}"})),
            (EventKind::Punishment, json!({"content": "{player} got {punishmentType} from {issuerName} at {warningCount}"})),
        ])))
    }

    fn capturing_sink() -> (Arc<MockWebhookSink>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = MockWebhookSink::new();
        sink.expect_deliver().returning(move |payload| {
            let _ = tx.send(payload);
            Ok(DeliveryOutcome::Delivered)
        });
        (Arc::new(sink), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_event_with_count() {
        let observers = ObserverRegistry::new();
        let store = Arc::new(WarningStore::new(Arc::new(MemoryBackend::new()), observers.clone()));
        let (sink, mut rx) = capturing_sink();
        observers.register(Arc::new(WebhookNotifier::new(templates(), sink).with_counts(&store)));

        let record = store.add_warning(&"Steve".into(), "spam", "Admin", None).await.unwrap();
        let payload = next(&mut rx).await;
        assert_eq!(
            payload["content"],
            format!("steve warned (#{}) for spam, total 1", record.id)
        );
    }

    #[tokio::test]
    async fn test_edit_event_payload() {
        let observers = ObserverRegistry::new();
        let store = Arc::new(WarningStore::new(Arc::new(MemoryBackend::new()), observers.clone()));
        let record = store.add_warning(&"steve".into(), "spam", "Admin", None).await.unwrap();

        let (sink, mut rx) = capturing_sink();
        observers.register(Arc::new(WebhookNotifier::new(templates(), sink)));
        store.edit_reason(record.id, &"steve".into(), "griefing").await.unwrap();

        assert_eq!(next(&mut rx).await["content"], "reason: spam -> griefing");
    }

    #[tokio::test]
    async fn test_punishment_event_payload() {
        let (sink, mut rx) = capturing_sink();
        let notifier = WebhookNotifier::new(templates(), sink);
        notifier
            .on_event(&LedgerEvent::Punished {
                account: "steve".into(),
                sanction: Sanction::BanIp,
                issuer: "Admin".to_string(),
                reason: "spam".to_string(),
                warning_count: Some(3),
            })
            .unwrap();

        assert_eq!(next(&mut rx).await["content"], "steve got ban-ip from Admin at 3");
    }

    #[tokio::test]
    async fn test_event_without_template_is_not_sent() {
        let mut sink = MockWebhookSink::new();
        sink.expect_deliver().never();
        let notifier = WebhookNotifier::new(templates(), Arc::new(sink));
        let record = WarningRecord {
            id: 1,
            account: "steve".into(),
            reason: "spam".to_string(),
            source: "Admin".to_string(),
            created_at: Utc::now(),
            expires_at: None,
        };
        notifier.on_event(&LedgerEvent::Removed { record }).unwrap();
        tokio::task::yield_now().await;
    }

    #[test]
    fn test_requires_runtime() {
        let (sink, _rx) = capturing_sink();
        let notifier = WebhookNotifier::new(templates(), sink);
        let event = LedgerEvent::Punished {
            account: "steve".into(),
            sanction: Sanction::Kick,
            issuer: "Console".to_string(),
            reason: "spam".to_string(),
            warning_count: None,
        };
        assert!(notifier.on_event(&event).is_err());
    }

    #[test]
    fn test_vars_for_expired() {
        let record = WarningRecord {
            id: 9,
            account: "alex".into(),
            reason: "caps".to_string(),
            source: "Console".to_string(),
            created_at: Utc::now(),
            expires_at: None,
        };
        let vars = event_vars(&LedgerEvent::Expired { record });
        assert!(vars.contains(&("expirationDate", "Never".to_string())));
        assert!(vars.contains(&("id", "9".to_string())));
    }
}
