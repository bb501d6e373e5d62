//! `{{name}}` placeholder templates.
//!
//! A template is compiled once into literal and reference segments and rendered against a
//! [`Plugins`] map. Rendering is total: a reference with no matching plugin renders as its
//! original `{{...}}` text, and an unterminated `{{` is plain text.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::Value;

/// A resolved placeholder value.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginValue {
    /// Inserted verbatim.
    Text(String),
    /// Inserted as compact JSON.
    Json(Value),
}

impl PluginValue {
    /// Block content as a plugin value: strings stay text, everything else is JSON.
    pub fn from_content(content: &Value) -> Self {
        match content {
            Value::String(s) => PluginValue::Text(s.clone()),
            other => PluginValue::Json(other.clone()),
        }
    }

    pub fn render(&self) -> Cow<'_, str> {
        match self {
            PluginValue::Text(s) => Cow::Borrowed(s),
            PluginValue::Json(v) => Cow::Owned(v.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PluginValue::Text(s) => Value::String(s.clone()),
            PluginValue::Json(v) => v.clone(),
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            PluginValue::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for PluginValue {
    fn from(value: &str) -> Self {
        PluginValue::Text(value.to_string())
    }
}

impl From<Value> for PluginValue {
    fn from(value: Value) -> Self {
        PluginValue::from_content(&value)
    }
}

/// Placeholder name to resolved value.
pub type Plugins = BTreeMap<String, PluginValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ref { name: String, raw: String },
}

/// A compiled `{{name}}` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                break;
            };
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let inner = &after_open[..close];
            segments.push(Segment::Ref {
                name: inner.trim().to_string(),
                raw: format!("{{{{{inner}}}}}"),
            });
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Self { segments }
    }

    pub fn render(&self, plugins: &Plugins) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref { name, raw } => match plugins.get(name) {
                    Some(value) => out.push_str(&value.render()),
                    None => out.push_str(raw),
                },
            }
        }
        out
    }

    /// Names referenced by the template, in order of appearance.
    pub fn refs(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_refs(&self) -> bool {
        self.refs().next().is_some()
    }
}

/// Compile and render in one step.
pub fn substitute(text: &str, plugins: &Plugins) -> String {
    Template::compile(text).render(plugins)
}

/// Substitute placeholders in every string inside a JSON value.
pub fn substitute_value(value: &Value, plugins: &Plugins) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, plugins)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, plugins))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, plugins)))
                .collect(),
        ),
        other => other.clone(),
    }
}
