//! `{placeholder}` substitution in agent instructions.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use relay_core::events::Part;
use relay_core::state::{APP_PREFIX, TEMP_PREFIX, USER_PREFIX};

use crate::callback::CallbackContext;
use crate::error::EngineError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{+[^{}]*\}+").unwrap());

const ARTIFACT_PREFIX: &str = "artifact.";

/// Replaces `{key}`, `{key?}` and `{artifact.name}` in `template`.
///
/// Strings are inserted verbatim, other values as JSON. A missing required
/// key fails with `MissingStateKey`; an optional one becomes empty.
/// Placeholders that are not valid state keys are left as written.
pub async fn inject_state(template: &str, ctx: &CallbackContext) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for found in PLACEHOLDER.find_iter(template) {
        out.push_str(&template[last..found.start()]);
        last = found.end();
        let raw = found.as_str();
        let replacement = resolve(raw, ctx).await?;
        out.push_str(replacement.as_deref().unwrap_or(raw));
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// `None` keeps the placeholder untouched.
async fn resolve(raw: &str, ctx: &CallbackContext) -> Result<Option<String>, EngineError> {
    let inner = raw.trim_matches(|c| c == '{' || c == '}').trim();
    let (key, optional) = match inner.strip_suffix('?') {
        Some(key) => (key, true),
        None => (inner, false),
    };

    if let Some(filename) = key.strip_prefix(ARTIFACT_PREFIX) {
        let artifact = ctx.load_artifact(filename, None).await?;
        return match artifact {
            Some(part) => Ok(Some(artifact_text(&part))),
            None if optional => Ok(Some(String::new())),
            None => Err(EngineError::MissingStateKey(key.to_string())),
        };
    }

    if !is_state_key(key) {
        return Ok(None);
    }
    match ctx.state().get(key) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(value) => Ok(Some(value.to_string())),
        None if optional => Ok(Some(String::new())),
        None => Err(EngineError::MissingStateKey(key.to_string())),
    }
}

fn artifact_text(part: &Part) -> String {
    match part {
        Part::Text { text } => text.clone(),
        Part::InlineData(blob) => String::from_utf8_lossy(&blob.data).into_owned(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// An identifier, optionally behind one scope prefix.
fn is_state_key(key: &str) -> bool {
    let name = [APP_PREFIX, USER_PREFIX, TEMP_PREFIX]
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key);
    is_identifier(name)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}
