//! Raw Kiro API payload types.
//!
//! The `conversationState`/`userInputMessage` envelope itself is assembled as
//! `serde_json::Value` directly in `convert::content`/`convert::request`
//! (its shape is too irregular across history-entry kinds for a single typed
//! struct to serialize correctly without a hand-written `Serialize` impl);
//! the types below cover the pieces that *are* uniform enough to share.

use serde::{Deserialize, Serialize};

/// Tool specification in Kiro format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolSpec {
    pub tool_specification: ToolSpecification,
}

/// Inner tool specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// Tool input schema wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

/// Tool result in Kiro format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub content: Vec<KiroTextContent>,
    pub status: String,
    pub tool_use_id: String,
}

/// Text content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroTextContent {
    pub text: String,
}

/// Image in Kiro format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImage {
    pub format: String,
    pub source: KiroImageSource,
}

/// Image source (base64 bytes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImageSource {
    pub bytes: String,
}

/// Tool use in an assistant response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub name: String,
    pub input: serde_json::Value,
    pub tool_use_id: String,
}

/// Parsed event from Kiro's AWS SSE stream.
#[derive(Debug, Clone)]
pub enum KiroStreamEvent {
    /// Text content chunk.
    Content(String),
    /// Tool call start.
    ToolStart {
        name: String,
        tool_use_id: String,
        input: String,
    },
    /// Tool call input continuation.
    ToolInput(String),
    /// Tool call end.
    ToolStop,
    /// Usage/metering data.
    Usage(serde_json::Value),
    /// Context usage percentage.
    ContextUsage(f64),
}
