//! Session history as model input.

use relay_core::events::{Content, Event, Part, Role};

/// How much history an `LlmAgent` sends to its model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IncludeContents {
    /// Every event visible on the agent's branch.
    #[default]
    Default,
    /// Only the current turn: events since the latest user message.
    None,
}

/// Builds the request contents for `agent_name` running on `branch`.
///
/// Events from other agents are recast as user-role context so the model
/// does not mistake them for its own output.
pub fn build_contents(
    events: &[Event],
    agent_name: &str,
    branch: Option<&str>,
    include: IncludeContents,
) -> Vec<Content> {
    let visible: Vec<&Event> = events
        .iter()
        .filter(|e| !e.partial && e.is_visible_to(branch))
        .filter(|e| e.content.as_ref().is_some_and(|c| !c.is_empty()))
        .collect();

    let start = match include {
        IncludeContents::Default => 0,
        IncludeContents::None => visible.iter().rposition(|e| e.is_user()).unwrap_or(0),
    };

    visible[start..]
        .iter()
        .filter_map(|event| {
            let content = event.content.as_ref()?;
            if event.is_user() || event.author == agent_name {
                Some(content.clone())
            } else {
                Some(as_context(&event.author, content))
            }
        })
        .collect()
}

fn as_context(author: &str, content: &Content) -> Content {
    let mut parts = vec![Part::text("For context:")];
    for part in &content.parts {
        let recast = match part {
            Part::Text { text } => Part::text(format!("[{author}] said: {text}")),
            Part::FunctionCall(call) => Part::text(format!(
                "[{author}] called tool `{}` with parameters: {}",
                call.name, call.args
            )),
            Part::FunctionResponse(resp) => Part::text(format!(
                "[{author}] `{}` tool returned result: {}",
                resp.name, resp.response
            )),
            Part::InlineData(_) => part.clone(),
        };
        parts.push(recast);
    }
    Content::new(Role::User, parts)
}
