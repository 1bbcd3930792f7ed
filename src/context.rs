//! Per-run store of values published by tasks.
//!
//! Every entry is keyed by `(task, key)` and has exactly one writer: the
//! task that owns it. Entries are append-only, so concurrent tasks never
//! contend for the same slot and a plain `RwLock<HashMap>` is all the
//! synchronisation needed.

use crate::core::task::TaskId;
use crate::error::ContextError;
use crate::template::{Reference, Segment, Template};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A value published into the run context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ContextValue {
    Text(String),
    Path(PathBuf),
}

impl ContextValue {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ContextValue::Path(path) => Some(path),
            ContextValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Text(text) => f.write_str(text),
            ContextValue::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<PathBuf> for ContextValue {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

type Slot = (TaskId, String);

/// Shared, append-only key/value store for one run.
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    values: Arc<RwLock<HashMap<Slot, ContextValue>>>,
}

impl RunContext {
    /// Create an empty run context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` under `(task, key)`.
    ///
    /// # Errors
    /// Returns `ContextError::DuplicateKey` if the slot was already written.
    /// The existing value is left untouched.
    pub async fn put(
        &self,
        task: &TaskId,
        key: &str,
        value: impl Into<ContextValue>,
    ) -> Result<(), ContextError> {
        let mut values = self.values.write().await;
        let slot = (task.clone(), key.to_string());
        if values.contains_key(&slot) {
            return Err(ContextError::DuplicateKey {
                task: task.clone(),
                key: key.to_string(),
            });
        }
        values.insert(slot, value.into());
        Ok(())
    }

    /// Read the value published under `(task, key)`.
    ///
    /// # Errors
    /// Returns `ContextError::UnresolvedReference` if nothing was published.
    pub async fn get(&self, task: &TaskId, key: &str) -> Result<ContextValue, ContextError> {
        let values = self.values.read().await;
        values
            .get(&(task.clone(), key.to_string()))
            .cloned()
            .ok_or_else(|| ContextError::UnresolvedReference {
                task: task.clone(),
                key: key.to_string(),
            })
    }

    /// Read the value a reference points at.
    pub async fn lookup(&self, reference: &Reference) -> Result<ContextValue, ContextError> {
        self.get(&reference.task, &reference.key).await
    }

    /// Substitute every reference in `template` with its published value.
    ///
    /// # Errors
    /// Returns `ContextError::TemplateSyntax` for malformed references and
    /// `ContextError::UnresolvedReference` for values not yet published.
    pub async fn resolve_template(&self, template: &Template) -> Result<String, ContextError> {
        self.render(template, |value| value.to_string()).await
    }

    /// Like [`resolve_template`](Self::resolve_template), but every
    /// substituted value is single-quoted as one `sh` word. Literal text is
    /// left as written, so globs and redirections in it keep working.
    pub async fn resolve_for_shell(&self, template: &Template) -> Result<String, ContextError> {
        self.render(template, |value| shell_quote(&value.to_string()))
            .await
    }

    async fn render<F>(&self, template: &Template, render_value: F) -> Result<String, ContextError>
    where
        F: Fn(&ContextValue) -> String,
    {
        let segments = template.segments()?;
        let values = self.values.read().await;

        let mut resolved = String::with_capacity(template.raw().len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => resolved.push_str(&text),
                Segment::Ref(reference) => {
                    let value = values
                        .get(&(reference.task.clone(), reference.key.clone()))
                        .ok_or(ContextError::UnresolvedReference {
                            task: reference.task,
                            key: reference.key,
                        })?;
                    resolved.push_str(&render_value(value));
                }
            }
        }
        Ok(resolved)
    }

    /// Number of published entries.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    /// Copy of every entry, ordered by task then key, for run reports.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, ContextValue>> {
        let values = self.values.read().await;
        let mut snapshot: BTreeMap<String, BTreeMap<String, ContextValue>> = BTreeMap::new();
        for ((task, key), value) in values.iter() {
            snapshot
                .entry(task.to_string())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        snapshot
    }
}

/// Quote `text` as a single `sh` word: `it's` becomes `'it'\''s'`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
