//! Webhook payload templates
//!
//! One JSON template per event kind, read from `<dir>/<kind>_event.json`.
//! String leaves are rendered with `{name}` substitution; nested objects and
//! arrays are walked up to a fixed depth. A kind without a template file is
//! simply not mirrored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use derive_more::Display;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::WEBHOOK_TARGET;

/// Deepest object or array nesting below the template root
pub const MAX_TEMPLATE_DEPTH: usize = 10;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template nesting exceeds {} levels", MAX_TEMPLATE_DEPTH)]
    TooDeep,

    #[error("Failed to read template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid template {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle event kinds that can be mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EventKind {
    #[display("add")]
    Add,
    #[display("remove")]
    Remove,
    #[display("edit")]
    Edit,
    #[display("expire")]
    Expire,
    #[display("punishment")]
    Punishment,
}

impl EventKind {
    pub const ALL: [Self; 5] = [Self::Add, Self::Remove, Self::Edit, Self::Expire, Self::Punishment];

    #[must_use]
    pub fn file_name(self) -> String {
        format!("{self}_event.json")
    }
}

/// Hot-reloadable set of templates
#[derive(Debug)]
pub struct TemplateSet {
    dir: Option<PathBuf>,
    templates: RwLock<HashMap<EventKind, Value>>,
}

impl TemplateSet {
    /// Templates held in memory, without a backing directory
    #[must_use]
    pub fn from_templates(templates: HashMap<EventKind, Value>) -> Self {
        Self {
            dir: None,
            templates: RwLock::new(templates),
        }
    }

    /// Load every template found in `dir`
    ///
    /// # Errors
    /// Returns an error if a template file exists but cannot be read or parsed.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let dir = dir.as_ref().to_path_buf();
        let templates = read_dir_templates(&dir).await?;
        Ok(Self {
            dir: Some(dir),
            templates: RwLock::new(templates),
        })
    }

    /// Re-read the template directory, keeping the old set on failure
    ///
    /// # Errors
    /// Returns an error if a template file cannot be read or parsed.
    pub async fn reload(&self) -> Result<usize, TemplateError> {
        let Some(dir) = &self.dir else {
            return Ok(self.len());
        };
        let templates = read_dir_templates(dir).await?;
        let count = templates.len();
        match self.templates.write() {
            Ok(mut current) => *current = templates,
            Err(poisoned) => *poisoned.into_inner() = templates,
        }
        info!(target: WEBHOOK_TARGET, count, "Webhook templates reloaded");
        Ok(count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.templates.read() {
            Ok(templates) => templates.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the template for `kind`, or `None` if there is none
    ///
    /// # Errors
    /// Returns `TemplateError::TooDeep` for templates nested too deeply.
    pub fn render(&self, kind: EventKind, vars: &[(&str, String)]) -> Result<Option<Value>, TemplateError> {
        let template = match self.templates.read() {
            Ok(templates) => templates.get(&kind).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&kind).cloned(),
        };
        match template {
            Some(template) if !is_empty_template(&template) => render_value(&template, vars, 0).map(Some),
            _ => Ok(None),
        }
    }
}

fn is_empty_template(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn render_value(value: &Value, vars: &[(&str, String)], depth: usize) -> Result<Value, TemplateError> {
    let nested = matches!(value, Value::Object(_) | Value::Array(_));
    if nested && depth > MAX_TEMPLATE_DEPTH {
        return Err(TemplateError::TooDeep);
    }
    Ok(match value {
        Value::String(text) => Value::String(substitute(text, vars)),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                rendered.insert(key.clone(), render_value(child, vars, depth + 1)?);
            }
            Value::Object(rendered)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|child| render_value(child, vars, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        other => other.clone(),
    })
}

fn substitute(text: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

async fn read_dir_templates(dir: &Path) -> Result<HashMap<EventKind, Value>, TemplateError> {
    let mut templates = HashMap::new();
    for kind in EventKind::ALL {
        let path = dir.join(kind.file_name());
        let exists = tokio::fs::try_exists(&path).await.map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;
        if !exists {
            debug!(target: WEBHOOK_TARGET, "No {kind} template at {}", path.display());
            continue;
        }
        let content = tokio::fs::read_to_string(&path).await.map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|source| TemplateError::Json {
            path: path.clone(),
            source,
        })?;
        if is_empty_template(&value) {
            warn!(target: WEBHOOK_TARGET, "Template {} is empty, {kind} events will not be sent", path.display());
        }
        templates.insert(kind, value);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars() -> Vec<(&'static str, String)> {
        vec![("player", "steve".to_string()), ("reason", "spam".to_string())]
    }

    #[test]
    fn test_render_nested() {
        let set = TemplateSet::from_templates(HashMap::from([(
            EventKind::Add,
            json!({
                "content": "{player} warned",
                "embeds": [{"title": "Reason: {reason}", "color": 16711680, "fields": [{"value": "{unknown}"}]}]
            }),
        )]));

        let rendered = set.render(EventKind::Add, &vars()).unwrap().unwrap();
        assert_eq!(rendered["content"], "steve warned");
        assert_eq!(rendered["embeds"][0]["title"], "Reason: spam");
        assert_eq!(rendered["embeds"][0]["color"], 16711680);
        assert_eq!(rendered["embeds"][0]["fields"][0]["value"], "{unknown}");
    }

    #[test]
    fn test_missing_or_empty_template_is_skipped() {
        let set = TemplateSet::from_templates(HashMap::from([(EventKind::Edit, json!({}))]));
        assert!(set.render(EventKind::Edit, &vars()).unwrap().is_none());
        assert!(set.render(EventKind::Remove, &vars()).unwrap().is_none());
    }

    #[test]
    fn test_depth_limit() {
        let mut deep = json!("{player}");
        for _ in 0..MAX_TEMPLATE_DEPTH + 2 {
            deep = json!({ "nested": deep });
        }
        let set = TemplateSet::from_templates(HashMap::from([(EventKind::Expire, deep)]));
        assert!(matches!(set.render(EventKind::Expire, &vars()), Err(TemplateError::TooDeep)));

        let mut shallow = json!("{player}");
        for _ in 0..=MAX_TEMPLATE_DEPTH {
            shallow = json!({ "nested": shallow });
        }
        let set = TemplateSet::from_templates(HashMap::from([(EventKind::Expire, shallow)]));
        assert!(set.render(EventKind::Expire, &vars()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("add_event.json"), r#"{"content": "{player}"}"#)
            .await
            .unwrap();

        let set = TemplateSet::load(dir.path()).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.render(EventKind::Punishment, &vars()).unwrap().is_none());

        tokio::fs::write(dir.path().join("punishment_event.json"), r#"{"content": "{reason}"}"#)
            .await
            .unwrap();
        assert_eq!(set.reload().await.unwrap(), 2);
        let rendered = set.render(EventKind::Punishment, &vars()).unwrap().unwrap();
        assert_eq!(rendered["content"], "spam");
    }

    #[tokio::test]
    async fn test_invalid_template_keeps_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("add_event.json"), r#"{"content": "ok"}"#)
            .await
            .unwrap();
        let set = TemplateSet::load(dir.path()).await.unwrap();

        tokio::fs::write(dir.path().join("add_event.json"), "{ broken").await.unwrap();
        assert!(matches!(set.reload().await, Err(TemplateError::Json { .. })));
        assert_eq!(set.len(), 1);
    }
}
