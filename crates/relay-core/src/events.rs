use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock;
use crate::ids::{EventId, FunctionCallId, InvocationId};
use crate::state::{merge_into, StateMap};

/// Author name used for events that carry user input.
pub const USER_AUTHOR: &str = "user";

/// Separator between branch segments.
pub const BRANCH_SEPARATOR: char = '.';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// Concatenated text of every text part, if any.
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.concat())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Part::is_empty)
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionResponse(resp) => Some(resp),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    InlineData(Blob),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { text } => text.is_empty(),
            Self::InlineData(blob) => blob.data.is_empty(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: FunctionCallId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: FunctionCallId::new(),
            name: name.into(),
            args,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: FunctionCallId,
    pub name: String,
    pub response: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A tool asking the user to approve its execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolConfirmation {
    pub hint: String,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Side effects carried by an event. Nothing outside an event's actions mutates state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
    /// Filename → version saved during this step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_delta: BTreeMap<String, u64>,
    #[serde(default)]
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    #[serde(default)]
    pub skip_summarization: bool,
    /// Keyed by the function call id that needs credentials.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requested_auth_configs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requested_tool_confirmations: BTreeMap<String, ToolConfirmation>,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Folds `other` into `self`. Later deltas win; flags accumulate.
    pub fn merge(&mut self, other: EventActions) {
        merge_into(&mut self.state_delta, &other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        self.escalate |= other.escalate;
        self.skip_summarization |= other.skip_summarization;
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.requested_auth_configs.extend(other.requested_auth_configs);
        self.requested_tool_confirmations
            .extend(other.requested_tool_confirmations);
    }
}

/// One immutable step of an invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub invocation_id: InvocationId,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<FunctionCallId>,
}

impl Event {
    pub fn new(invocation_id: InvocationId, author: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            invocation_id,
            author: author.into(),
            branch: None,
            timestamp: clock::now(),
            content: None,
            actions: EventActions::default(),
            partial: false,
            turn_complete: false,
            error_code: None,
            error_message: None,
            long_running_tool_ids: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.actions.state_delta = delta;
        self
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn is_user(&self) -> bool {
        self.author == USER_AUTHOR
    }

    pub fn text(&self) -> Option<String> {
        self.content.as_ref().and_then(Content::text)
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.content
            .as_ref()
            .map(|c| c.function_calls().collect())
            .unwrap_or_default()
    }

    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.content
            .as_ref()
            .map(|c| c.function_responses().collect())
            .unwrap_or_default()
    }

    /// Whether this event ends the producing agent's turn.
    pub fn is_final_response(&self) -> bool {
        if self.actions.skip_summarization || !self.long_running_tool_ids.is_empty() {
            return true;
        }
        !self.partial && self.function_calls().is_empty() && self.function_responses().is_empty()
    }

    /// Whether a context running on `branch` may see this event in its history.
    ///
    /// Unbranched events are visible everywhere. Branched events are visible on
    /// their own branch and on every branch nested under it.
    pub fn is_visible_to(&self, branch: Option<&str>) -> bool {
        match (self.branch.as_deref(), branch) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(own), Some(current)) => is_branch_prefix(own, current),
        }
    }
}

/// Appends `segment` to `parent`.
pub fn child_branch(parent: Option<&str>, segment: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{parent}{BRANCH_SEPARATOR}{segment}"),
        _ => segment.to_string(),
    }
}

/// Segment-aware prefix test: `a.b` is a prefix of `a.b.c` but not of `a.bc`.
pub fn is_branch_prefix(prefix: &str, branch: &str) -> bool {
    match branch.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(BRANCH_SEPARATOR),
        None => false,
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(author: &str) -> Event {
        Event::new(InvocationId::new(), author)
    }

    #[test]
    fn new_event_has_defaults() {
        let e = event("agent");
        assert!(e.id.as_str().starts_with("evt_"));
        assert!(e.actions.is_empty());
        assert!(e.content.is_none());
        assert!(!e.partial);
        assert!(e.timestamp > 0.0);
    }

    #[test]
    fn timestamps_increase() {
        let a = event("a");
        let b = event("b");
        assert!(a.timestamp < b.timestamp);
    }

    #[test]
    fn branch_prefix_is_segment_aware() {
        assert!(is_branch_prefix("p", "p"));
        assert!(is_branch_prefix("p", "p.x"));
        assert!(is_branch_prefix("p.x", "p.x.y"));
        assert!(!is_branch_prefix("p.x", "p.xy"));
        assert!(!is_branch_prefix("p.x", "p.y"));
        assert!(!is_branch_prefix("p.x.y", "p.x"));
    }

    #[test]
    fn visibility_rules() {
        let root = event("a");
        let own = event("a").with_branch(Some("par.x".into()));
        let sibling = event("b").with_branch(Some("par.y".into()));
        let ancestor = event("c").with_branch(Some("par".into()));

        assert!(root.is_visible_to(Some("par.x")));
        assert!(own.is_visible_to(Some("par.x")));
        assert!(ancestor.is_visible_to(Some("par.x")));
        assert!(!sibling.is_visible_to(Some("par.x")));
        assert!(!own.is_visible_to(None));
    }

    #[test]
    fn child_branch_joins_segments() {
        assert_eq!(child_branch(None, "par"), "par");
        assert_eq!(child_branch(Some("outer"), "par"), "outer.par");
    }

    #[test]
    fn final_response_classification() {
        let text = event("a").with_content(Content::model_text("done"));
        assert!(text.is_final_response());

        let partial = text.clone().with_partial(true);
        assert!(!partial.is_final_response());

        let call = event("a").with_content(Content::new(
            Role::Model,
            vec![Part::FunctionCall(FunctionCall::new("lookup", json!({})))],
        ));
        assert!(!call.is_final_response());

        let mut skipped = call.clone();
        skipped.actions.skip_summarization = true;
        assert!(skipped.is_final_response());
    }

    #[test]
    fn actions_merge_accumulates() {
        let mut a = EventActions::default();
        a.state_delta.insert("x".into(), json!(1));
        let mut b = EventActions {
            escalate: true,
            transfer_to_agent: Some("billing".into()),
            ..Default::default()
        };
        b.state_delta.insert("x".into(), json!(2));
        b.artifact_delta.insert("report.txt".into(), 0);

        a.merge(b);
        assert_eq!(a.state_delta["x"], json!(2));
        assert!(a.escalate);
        assert_eq!(a.transfer_to_agent.as_deref(), Some("billing"));
        assert_eq!(a.artifact_delta.get("report.txt"), Some(&0));
    }

    #[test]
    fn content_text_concatenates_parts() {
        let content = Content::new(
            Role::Model,
            vec![
                Part::text("hello "),
                Part::FunctionCall(FunctionCall::new("noop", Value::Null)),
                Part::text("world"),
            ],
        );
        assert_eq!(content.text().as_deref(), Some("hello world"));
        assert_eq!(content.function_calls().count(), 1);
    }

    #[test]
    fn inline_data_serializes_as_base64() {
        let part = Part::InlineData(Blob {
            mime_type: "text/plain".into(),
            data: b"hi".to_vec(),
        });
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "inline_data");
        assert_eq!(json["data"], "aGk=");
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn empty_actions_are_omitted_from_json() {
        let json = serde_json::to_value(event("a")).unwrap();
        assert_eq!(json["actions"], json!({"escalate": false, "skip_summarization": false}));
    }
}
