//! Typed inter-task references embedded in task configuration.
//!
//! A [`Template`] is configuration text that may contain references of the
//! form `ref(task, key)`. Templates are never interpolated as raw strings:
//! they are parsed into [`Segment`]s, and every reference becomes a typed
//! [`Reference`] that the run context resolves explicitly.

use crate::core::task::TaskId;
use crate::error::ContextError;
use regex::Regex;
use std::sync::LazyLock;

const REF_OPEN: &str = "ref(";

/// `ref(task, key)` anchored at the start of the input.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ref\(\s*([A-Za-z0-9_.\-]+)\s*,\s*([A-Za-z0-9_.\-]+)\s*\)").unwrap()
});

/// A reference to a value published by another task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The task that publishes the value.
    pub task: TaskId,
    /// The key the value is published under.
    pub key: String,
}

impl Reference {
    /// Create a reference to `key` published by `task`.
    pub fn new(task: impl Into<TaskId>, key: &str) -> Self {
        Self {
            task: task.into(),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ref({}, {})", self.task, self.key)
    }
}

/// One parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text copied verbatim.
    Literal(String),
    /// A value looked up in the run context.
    Ref(Reference),
}

/// Configuration text that may reference values published by other tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    raw: String,
}

impl Template {
    /// Wrap raw template text. Syntax is checked when the template is parsed.
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
        }
    }

    /// Start building a template from typed segments.
    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    /// The template text as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parse the template into literal and reference segments.
    ///
    /// # Errors
    /// Returns `ContextError::TemplateSyntax` if a `ref(` opener is not
    /// followed by `task, key)`.
    pub fn segments(&self) -> Result<Vec<Segment>, ContextError> {
        let raw = self.raw.as_str();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut cursor = 0;

        while let Some(offset) = raw[cursor..].find(REF_OPEN) {
            let position = cursor + offset;

            // `href(` and friends are plain text.
            let preceded_by_ident = raw[..position]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_alphanumeric() || c == '_')
                .unwrap_or(false);
            if preceded_by_ident {
                cursor = position + REF_OPEN.len();
                continue;
            }

            let captures = REFERENCE_RE
                .captures(&raw[position..])
                .ok_or_else(|| self.syntax_error(position))?;

            if position > literal_start {
                segments.push(Segment::Literal(raw[literal_start..position].to_string()));
            }
            segments.push(Segment::Ref(Reference::new(&captures[1], &captures[2])));

            cursor = position + captures[0].len();
            literal_start = cursor;
        }

        if literal_start < raw.len() {
            segments.push(Segment::Literal(raw[literal_start..].to_string()));
        }

        Ok(segments)
    }

    /// All references in the template, in order of appearance.
    pub fn references(&self) -> Result<Vec<Reference>, ContextError> {
        Ok(self
            .segments()?
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Ref(reference) => Some(reference),
                Segment::Literal(_) => None,
            })
            .collect())
    }

    fn syntax_error(&self, position: usize) -> ContextError {
        let rest = &self.raw[position..];
        let reason = if !rest.contains(')') {
            "unterminated reference".to_string()
        } else {
            "expected ref(task, key)".to_string()
        };
        ContextError::TemplateSyntax {
            template: self.raw.clone(),
            position,
            reason,
        }
    }
}

impl From<&str> for Template {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Template {
    fn from(raw: String) -> Self {
        Self { raw }
    }
}

impl From<Reference> for Template {
    fn from(reference: Reference) -> Self {
        Self::builder().reference(reference).build()
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Builds a [`Template`] from typed segments so references are well formed
/// by construction.
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    raw: String,
}

impl TemplateBuilder {
    /// Append literal text.
    pub fn text(mut self, text: &str) -> Self {
        self.raw.push_str(text);
        self
    }

    /// Append a reference.
    pub fn reference(mut self, reference: Reference) -> Self {
        self.raw.push_str(&reference.to_string());
        self
    }

    /// Append a reference to `key` published by `task`.
    pub fn value_of(self, task: &str, key: &str) -> Self {
        self.reference(Reference::new(task, key))
    }

    pub fn build(self) -> Template {
        Template { raw: self.raw }
    }
}
