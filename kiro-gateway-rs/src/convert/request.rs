//! Convert Anthropic MessagesRequest to Kiro API payload.

use uuid::Uuid;

use crate::config::{
    API_ORIGIN, DEFAULT_THINKING_BUDGET, HISTORY_BYTE_BUDGET, MAX_TOOL_DESCRIPTION_LENGTH,
    MAX_TOOL_NAME_LENGTH, MIN_HISTORY_LEN,
};
use crate::convert::content;
use crate::convert::schema::sanitize_json_schema;
use crate::error::{Error, Result};
use crate::models::kiro::{InputSchema, KiroToolSpec, ToolSpecification};
use crate::models::request::{ContentBlock, Message, MessageContent, MessagesRequest, Role, SystemPrompt, Tool};

/// How many trailing messages keep their inline images; older ones are
/// replaced with a `[image omitted]` placeholder.
const IMAGE_RETENTION_WINDOW: usize = 5;

/// Convert a `MessagesRequest` into a Kiro API JSON payload.
pub fn build_kiro_payload(
    request: &MessagesRequest,
    model_id: &str,
    profile_arn: Option<&str>,
) -> Result<serde_json::Value> {
    if request.messages.is_empty() {
        return Err(Error::EmptyMessages);
    }

    let conversation_id = Uuid::new_v4().to_string();

    // Process messages: merge adjacent same-role, drop the malformed trailing
    // assistant "{" artefact, ensure alternating, force the turn to end on user.
    let mut processed = process_messages(&request.messages);
    if processed.is_empty() {
        return Err(Error::EmptyMessages);
    }

    apply_image_retention_policy(&mut processed);

    // Sanitise tool-use/tool-result pairing across the whole turn sequence
    // (including the about-to-become-current message) before splitting it
    // off, since the last history entry's tool uses are commonly paired
    // with the current message's tool results.
    sanitize_tool_pairing(&mut processed);

    // The last message becomes currentMessage; everything before is history.
    let current = processed.pop().expect("checked non-empty above");
    let mut history_msgs = processed;

    // Build tool context.
    let mut system_overflow = String::new();
    let mut kiro_tool_names: Vec<String> = Vec::new();
    let mut kiro_tools: Vec<KiroToolSpec> = Vec::new();

    if let Some(tools) = &request.tools {
        let (tools_out, overflow) = convert_tools(tools);
        kiro_tool_names = tools_out
            .iter()
            .map(|t| t.tool_specification.name.clone())
            .collect();
        kiro_tools = tools_out;
        system_overflow = overflow;
    }
    append_placeholder_specs_for_history_tools(&history_msgs, &mut kiro_tools, &kiro_tool_names);

    history_msgs = enforce_history_budget(history_msgs, model_id);

    // Build system prompt: explicit system text + tool-description overflow,
    // with the extended-thinking prefix prepended when thinking is requested.
    let wants_thinking = request.thinking.is_some() || model_id.ends_with("-thinking");
    let thinking_budget = request
        .thinking
        .as_ref()
        .and_then(|t| t.budget_tokens)
        .unwrap_or(DEFAULT_THINKING_BUDGET);

    let mut system_text = build_system_prompt(request.system.as_ref(), &system_overflow);
    if wants_thinking {
        let prefix = format!(
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
            thinking_budget
        );
        system_text = if system_text.is_empty() {
            prefix
        } else {
            format!("{}\n\n{}", prefix, system_text)
        };
    }

    // System prompt placement: prepend to the first user message in history
    // if one exists, otherwise to the current message, otherwise emit a
    // synthetic leading userInputMessage carrying just the system prompt.
    if !system_text.is_empty() {
        if let Some(first) = history_msgs.first_mut() {
            if first.role == Role::User {
                prepend_text(&mut first.content, &system_text);
            } else {
                history_msgs.insert(
                    0,
                    Message {
                        role: Role::User,
                        content: MessageContent::Text(system_text.clone()),
                    },
                );
            }
        }
    }

    // Build current message.
    let current_text = content::extract_text(&current.content);
    let current_images = content::extract_images(&current.content);
    let current_tool_results = content::extract_tool_results(&current.content);

    let mut current_message = serde_json::json!({
        "userInputMessage": {
            "content": current_text,
            "modelId": model_id,
            "origin": API_ORIGIN,
        }
    });

    if !current_images.is_empty() {
        current_message["userInputMessage"]["images"] =
            serde_json::to_value(&current_images).unwrap_or_default();
    }

    let mut context = serde_json::Map::new();
    if !kiro_tools.is_empty() {
        context.insert(
            "tools".to_string(),
            serde_json::to_value(&kiro_tools).unwrap_or_default(),
        );
    }
    if !current_tool_results.is_empty() {
        context.insert(
            "toolResults".to_string(),
            serde_json::to_value(&current_tool_results).unwrap_or_default(),
        );
    }
    if !context.is_empty() {
        current_message["userInputMessage"]["userInputMessageContext"] =
            serde_json::Value::Object(context);
    }

    let mut final_content = if history_msgs.is_empty() && !system_text.is_empty() {
        format!("{}\n\n{}", system_text, current_text)
    } else {
        current_text.clone()
    };
    if final_content.trim().is_empty() {
        final_content = if current_tool_results.is_empty() {
            "Continue".to_string()
        } else {
            "Tool results provided.".to_string()
        };
    }

    if final_content != current_text {
        current_message["userInputMessage"]["content"] = serde_json::Value::String(final_content);
    }

    // Build history.
    let history: Vec<serde_json::Value> = history_msgs
        .iter()
        .map(|msg| content::message_to_history_entry(msg, model_id))
        .collect();

    // Assemble final payload.
    let mut payload = serde_json::json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": conversation_id,
            "currentMessage": current_message,
        }
    });

    if !history.is_empty() {
        payload["conversationState"]["history"] = serde_json::Value::Array(history);
    }

    if let Some(arn) = profile_arn {
        payload["profileArn"] = serde_json::Value::String(arn.to_string());
    }

    Ok(payload)
}

/// Prepend `prefix` ahead of a message's existing text, preserving any
/// non-text content blocks.
fn prepend_text(content: &mut MessageContent, prefix: &str) {
    match content {
        MessageContent::Text(t) => {
            *t = format!("{}\n\n{}", prefix, t);
        }
        MessageContent::Blocks(blocks) => {
            blocks.insert(
                0,
                ContentBlock::Text {
                    text: format!("{}\n\n", prefix),
                },
            );
        }
    }
}

/// Replace inline images with a text placeholder for every message older
/// than [`IMAGE_RETENTION_WINDOW`] turns from the tail of the conversation.
fn apply_image_retention_policy(messages: &mut [Message]) {
    let len = messages.len();
    for (i, msg) in messages.iter_mut().enumerate() {
        if len - i <= IMAGE_RETENTION_WINDOW {
            continue;
        }
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            if !blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })) {
                continue;
            }
            let mut replaced = Vec::with_capacity(blocks.len());
            for block in blocks.drain(..) {
                match block {
                    ContentBlock::Image { .. } => replaced.push(ContentBlock::Text {
                        text: "[image omitted]".to_string(),
                    }),
                    other => replaced.push(other),
                }
            }
            *blocks = replaced;
        }
    }
}

/// Drop any `assistantResponseMessage.toolUses` entry with no matching
/// `userInputMessage.toolResults` in the immediately following message, and
/// vice versa. Deduplicates tool results by `toolUseId` within a message.
fn sanitize_tool_pairing(messages: &mut [Message]) {
    for i in 0..messages.len() {
        if messages[i].role != Role::Assistant {
            continue;
        }
        let pending_ids: Vec<String> = match &messages[i].content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        if pending_ids.is_empty() {
            continue;
        }

        let result_ids: std::collections::HashSet<String> = messages
            .get(i + 1)
            .map(|next| match &next.content {
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => std::collections::HashSet::new(),
            })
            .unwrap_or_default();

        if let MessageContent::Blocks(blocks) = &mut messages[i].content {
            blocks.retain(|b| match b {
                ContentBlock::ToolUse { id, .. } => result_ids.contains(id),
                _ => true,
            });
        }

        let use_ids: std::collections::HashSet<String> = pending_ids.into_iter().collect();
        if let Some(next) = messages.get_mut(i + 1) {
            if let MessageContent::Blocks(blocks) = &mut next.content {
                let mut seen = std::collections::HashSet::new();
                blocks.retain(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        use_ids.contains(tool_use_id) && seen.insert(tool_use_id.clone())
                    }
                    _ => true,
                });
            }
        }
    }
}

/// Append placeholder tool specs for any tool name used in history but not
/// present in the caller's current tool list, so upstream validation passes.
fn append_placeholder_specs_for_history_tools(
    history_msgs: &[Message],
    kiro_tools: &mut Vec<KiroToolSpec>,
    known: &[String],
) {
    let mut known_set: std::collections::HashSet<String> = known.iter().cloned().collect();
    for msg in history_msgs {
        if msg.role != Role::Assistant {
            continue;
        }
        if let MessageContent::Blocks(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::ToolUse { name, .. } = block {
                    if known_set.insert(name.clone()) {
                        kiro_tools.push(KiroToolSpec {
                            tool_specification: ToolSpecification {
                                name: name.clone(),
                                description: "Tool referenced in conversation history.".to_string(),
                                input_schema: InputSchema {
                                    json: serde_json::json!({"type": "object", "properties": {}}),
                                },
                            },
                        });
                    }
                }
            }
        }
    }
}

/// Drop history entries from the front, re-sanitising tool pairing each time,
/// until the serialized history fits within [`HISTORY_BYTE_BUDGET`] or only
/// [`MIN_HISTORY_LEN`] entries remain.
fn enforce_history_budget(mut history_msgs: Vec<Message>, model_id: &str) -> Vec<Message> {
    loop {
        let entries: Vec<serde_json::Value> = history_msgs
            .iter()
            .map(|m| content::message_to_history_entry(m, model_id))
            .collect();
        let size = serde_json::to_vec(&entries).map(|v| v.len()).unwrap_or(0);
        if size <= HISTORY_BYTE_BUDGET || history_msgs.len() <= MIN_HISTORY_LEN {
            break;
        }
        history_msgs.remove(0);
        sanitize_tool_pairing(&mut history_msgs);
    }
    history_msgs
}

/// Process messages: merge adjacent same-role, ensure alternating user/assistant.
fn process_messages(messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut result: Vec<Message> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => Role::User, // Normalize system to user
            other => other,
        };

        // Merge with previous if same role (preserve all content blocks, not just text)
        if let Some(last) = result.last_mut() {
            if last.role == role {
                last.content = merge_content(&last.content, &msg.content);
                continue;
            }
        }

        result.push(Message {
            role,
            content: msg.content.clone(),
        });
    }

    // Drop a final assistant message whose concatenated text is just "{" - a
    // known malformed-prefix artefact from truncated upstream generations.
    if result
        .last()
        .is_some_and(|m| m.role == Role::Assistant && m.content.text() == "{")
    {
        result.pop();
    }

    // Ensure the conversation starts with user and alternates
    ensure_alternating(&mut result);

    // Ensure last message is from user (required by Kiro)
    if result.last().is_some_and(|m| m.role != Role::User) {
        result.push(Message {
            role: Role::User,
            content: crate::models::request::MessageContent::Text("Continue.".to_string()),
        });
    }

    result
}

/// Merge two message contents, preserving all content blocks (text, images, tool results, etc.).
fn merge_content(
    existing: &crate::models::request::MessageContent,
    new: &crate::models::request::MessageContent,
) -> crate::models::request::MessageContent {
    use crate::models::request::{ContentBlock, MessageContent};

    let mut blocks: Vec<ContentBlock> = match existing {
        MessageContent::Text(t) => vec![ContentBlock::Text { text: t.clone() }],
        MessageContent::Blocks(b) => b.clone(),
    };

    match new {
        MessageContent::Text(t) => blocks.push(ContentBlock::Text { text: t.clone() }),
        MessageContent::Blocks(b) => blocks.extend(b.iter().cloned()),
    }

    MessageContent::Blocks(blocks)
}

/// Ensure messages alternate between user and assistant by inserting fillers.
fn ensure_alternating(messages: &mut Vec<Message>) {
    let mut i = 1;
    while i < messages.len() {
        if messages[i].role == messages[i - 1].role {
            let filler_role = if messages[i].role == Role::User {
                Role::Assistant
            } else {
                Role::User
            };
            let filler_text = if filler_role == Role::Assistant {
                "Understood."
            } else {
                "Continue."
            };
            messages.insert(
                i,
                Message {
                    role: filler_role,
                    content: crate::models::request::MessageContent::Text(filler_text.to_string()),
                },
            );
            i += 2;
        } else {
            i += 1;
        }
    }
}

/// Convert Anthropic tools to Kiro format, handling overflow for long descriptions.
fn convert_tools(tools: &[Tool]) -> (Vec<KiroToolSpec>, String) {
    let mut kiro_tools = Vec::new();
    let mut overflow_parts = Vec::new();

    for tool in tools {
        let lowered = tool.name.to_ascii_lowercase();
        if lowered == "web_search" || lowered == "websearch" {
            continue;
        }

        let description = tool.description.clone().unwrap_or_default();

        // Truncate tool name if needed
        let name = if tool.name.len() > MAX_TOOL_NAME_LENGTH {
            tool.name[..MAX_TOOL_NAME_LENGTH].to_string()
        } else {
            tool.name.clone()
        };

        // If description is too long, move it to system prompt overflow
        let (tool_description, overflow) = if description.len() > MAX_TOOL_DESCRIPTION_LENGTH {
            let short = format!(
                "{}... (full description in system prompt)",
                &description[..200]
            );
            let full = format!(
                "Tool '{}' full description:\n{}",
                name, description
            );
            (short, Some(full))
        } else {
            (description, None)
        };

        if let Some(overflow_text) = overflow {
            overflow_parts.push(overflow_text);
        }

        let schema = sanitize_json_schema(&tool.input_schema);

        kiro_tools.push(KiroToolSpec {
            tool_specification: ToolSpecification {
                name,
                description: tool_description,
                input_schema: InputSchema { json: schema },
            },
        });
    }

    let overflow = if overflow_parts.is_empty() {
        String::new()
    } else {
        overflow_parts.join("\n\n")
    };

    (kiro_tools, overflow)
}

/// Build the system prompt from explicit system + overflow.
fn build_system_prompt(system: Option<&SystemPrompt>, overflow: &str) -> String {
    let mut parts = Vec::new();

    if let Some(sys) = system {
        let text = sys.text();
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if !overflow.is_empty() {
        parts.push(overflow.to_string());
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{MessageContent, Message, Role};

    #[test]
    fn test_process_messages_merge_adjacent() {
        let messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("Hello".into()),
            },
            Message {
                role: Role::User,
                content: MessageContent::Text("World".into()),
            },
        ];
        let result = process_messages(&messages);
        assert_eq!(result.len(), 1);
        // Merged as blocks: text from both messages preserved
        assert_eq!(result[0].content.text(), "HelloWorld");
    }

    #[test]
    fn test_process_messages_merge_preserves_non_text_blocks() {
        use crate::models::request::{ContentBlock, ImageSource};

        let messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![
                    ContentBlock::Text { text: "Look at this:".into() },
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64".into(),
                            media_type: "image/png".into(),
                            data: "iVBOR".into(),
                        },
                    },
                ]),
            },
            Message {
                role: Role::User,
                content: MessageContent::Text("What do you see?".into()),
            },
        ];
        let result = process_messages(&messages);
        assert_eq!(result.len(), 1);
        match &result[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 3); // text + image + text
                assert!(matches!(&blocks[1], ContentBlock::Image { .. }));
            }
            _ => panic!("Expected Blocks content after merge"),
        }
    }

    #[test]
    fn test_process_messages_alternating() {
        let messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("Hi".into()),
            },
            Message {
                role: Role::Assistant,
                content: MessageContent::Text("Hey".into()),
            },
            Message {
                role: Role::User,
                content: MessageContent::Text("What?".into()),
            },
        ];
        let result = process_messages(&messages);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_process_messages_ensures_user_last() {
        let messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("Hi".into()),
            },
            Message {
                role: Role::Assistant,
                content: MessageContent::Text("Hey".into()),
            },
        ];
        let result = process_messages(&messages);
        assert_eq!(result.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_build_kiro_payload_minimal() {
        let request = MessagesRequest {
            model: "claude-sonnet-4.5".into(),
            max_tokens: 1024,
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("Hello".into()),
            }],
            system: None,
            tools: None,
            tool_choice: None,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            thinking: None,
        };

        let payload = build_kiro_payload(&request, "claude-sonnet-4.5", None).unwrap();
        assert!(payload.get("conversationState").is_some());
        let current = &payload["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(current["content"].as_str().unwrap(), "Hello");
        assert_eq!(current["modelId"].as_str().unwrap(), "claude-sonnet-4.5");
    }

    #[test]
    fn thinking_request_prepends_thinking_mode_prefix() {
        use crate::models::request::ThinkingConfig;

        let request = MessagesRequest {
            model: "claude-sonnet-4.5".into(),
            max_tokens: 1024,
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("Hello".into()),
            }],
            system: Some(SystemPrompt::Text("Be terse.".into())),
            tools: None,
            tool_choice: None,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            thinking: Some(ThinkingConfig {
                thinking_type: "enabled".into(),
                budget_tokens: Some(5000),
            }),
        };

        let payload = build_kiro_payload(&request, "claude-sonnet-4.5", None).unwrap();
        let content = payload["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(content.contains("<thinking_mode>enabled</thinking_mode>"));
        assert!(content.contains("<max_thinking_length>5000</max_thinking_length>"));
        assert!(content.contains("Be terse."));
        assert!(content.contains("Hello"));
    }

    #[test]
    fn web_search_tool_is_filtered_out() {
        let tools = vec![
            Tool {
                name: "web_search".into(),
                description: Some("searches the web".into()),
                input_schema: serde_json::json!({"type": "object"}),
            },
            Tool {
                name: "calculator".into(),
                description: Some("adds numbers".into()),
                input_schema: serde_json::json!({"type": "object"}),
            },
        ];
        let (kiro_tools, _) = convert_tools(&tools);
        assert_eq!(kiro_tools.len(), 1);
        assert_eq!(kiro_tools[0].tool_specification.name, "calculator");
    }

    #[test]
    fn unmatched_tool_use_is_dropped_from_history() {
        use crate::models::request::ContentBlock;

        let mut messages = vec![
            Message {
                role: Role::User,
                content: MessageContent::Text("Do a thing".into()),
            },
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "orphan".into(),
                    name: "calculator".into(),
                    input: serde_json::json!({}),
                }]),
            },
            Message {
                role: Role::User,
                content: MessageContent::Text("thanks".into()),
            },
        ];
        sanitize_tool_pairing(&mut messages);
        match &messages[1].content {
            MessageContent::Blocks(blocks) => assert!(blocks.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn history_budget_trims_oldest_entries_first() {
        let mut messages = Vec::new();
        for i in 0..10 {
            messages.push(Message {
                role: Role::User,
                content: MessageContent::Text("x".repeat(200_000)),
            });
            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Text(format!("turn {i}")),
            });
        }
        let trimmed = enforce_history_budget(messages, "claude-sonnet-4.5");
        let entries: Vec<serde_json::Value> = trimmed
            .iter()
            .map(|m| content::message_to_history_entry(m, "claude-sonnet-4.5"))
            .collect();
        let size = serde_json::to_vec(&entries).unwrap().len();
        assert!(size <= HISTORY_BYTE_BUDGET || trimmed.len() <= MIN_HISTORY_LEN);
    }
}
