use serde::Serialize;
use sha2::{Digest, Sha256};
use shardgate_common::Mode;
use uuid::Uuid;

use crate::openai::{ChatCompletionRequest, ChatMessage};
use crate::tools::{agent_tools, ToolDefinition};

/// Prepended to the live message in agent mode so the upstream answers inline.
pub const NO_MUTATION_PROMPT: &str =
    "All replies must not create, modify, or delete files, and must provide content directly!";
pub const PREFIX: &str = "You are an AI assistant, help me to solve problems!";
const AGENT_GUIDELINES: &str = "Do not call any tools and do not create, modify, or delete files. \
Answer web-search style questions from existing knowledge.";
const CHAT_GUIDELINES: &str = "Answer directly and concisely.";
const DEFAULT_LANG: &str = "HTML";

/// Checked in order; the first substring found wins.
const LANGUAGES: &[(&str, &str)] = &[
    ("html", "HTML"),
    ("python", "Python"),
    ("javascript", "JavaScript"),
    ("go", "Go"),
    ("rust", "Rust"),
    ("java", "Java"),
    ("c++", "C++"),
    ("c#", "C#"),
    ("php", "PHP"),
    ("ruby", "Ruby"),
    ("swift", "Swift"),
    ("kotlin", "Kotlin"),
    ("typescript", "TypeScript"),
    ("c", "C"),
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct Node {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: u32,
    pub content: String,
    pub tool_use: ToolUse,
    pub agent_memory: AgentMemory,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input_json: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMemory {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryTurn {
    pub request_message: String,
    pub response_text: String,
    pub request_id: String,
    pub request_nodes: Vec<Node>,
    pub response_nodes: Vec<Node>,
}

impl HistoryTurn {
    fn new(request: String, response: String) -> Self {
        Self {
            response_nodes: vec![Node {
                content: response.clone(),
                ..Node::default()
            }],
            request_message: request,
            response_text: response,
            request_id: Uuid::new_v4().to_string(),
            request_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Blobs {
    pub checkpoint_id: String,
    pub added_blobs: Vec<String>,
    pub deleted_blobs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureFlags {
    pub support_raw_output: bool,
}

/// Body of a `chat-stream` call.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub chat_history: Vec<HistoryTurn>,
    pub message: String,
    pub agent_memories: String,
    pub mode: &'static str,
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub lang: &'static str,
    pub path: String,
    pub user_guidelines: &'static str,
    pub blobs: Blobs,
    pub user_guided_blobs: Vec<String>,
    pub external_source_ids: Vec<String>,
    pub feature_detection_flags: FeatureFlags,
    pub tool_definitions: Vec<ToolDefinition>,
    pub nodes: Vec<Node>,
}

impl UpstreamRequest {
    /// Estimated prompt size: the live message plus every history turn.
    pub fn prompt_tokens(&self) -> usize {
        crate::tokens::estimate_tokens(&self.message)
            + self
                .chat_history
                .iter()
                .map(|t| {
                    crate::tokens::estimate_tokens(&t.request_message)
                        + crate::tokens::estimate_tokens(&t.response_text)
                })
                .sum::<usize>()
    }
}

pub fn to_upstream(req: &ChatCompletionRequest) -> UpstreamRequest {
    let mode = Mode::from_model(&req.model);
    let (history, live) = split_history(&req.messages);
    let live_text = live.map(ChatMessage::text).unwrap_or_default();

    let message = match mode {
        Mode::Agent => format!("{NO_MUTATION_PROMPT}\n{live_text}"),
        Mode::Chat => live_text.clone(),
    };

    UpstreamRequest {
        chat_history: history,
        message,
        agent_memories: String::new(),
        mode: mode.upstream_name(),
        prefix: PREFIX,
        suffix: " ",
        lang: detect_language(&live_text),
        path: String::new(),
        user_guidelines: match mode {
            Mode::Agent => AGENT_GUIDELINES,
            Mode::Chat => CHAT_GUIDELINES,
        },
        blobs: Blobs {
            checkpoint_id: checkpoint_id(),
            added_blobs: Vec::new(),
            deleted_blobs: Vec::new(),
        },
        user_guided_blobs: Vec::new(),
        external_source_ids: Vec::new(),
        feature_detection_flags: FeatureFlags {
            support_raw_output: true,
        },
        tool_definitions: match mode {
            Mode::Agent => agent_tools(),
            Mode::Chat => Vec::new(),
        },
        nodes: Vec::new(),
    }
}

/// Everything before the last message, paired as (request, response), and
/// the last message itself. An unpaired leftover becomes a turn with an
/// empty response.
fn split_history(messages: &[ChatMessage]) -> (Vec<HistoryTurn>, Option<&ChatMessage>) {
    let Some((live, earlier)) = messages.split_last() else {
        return (Vec::new(), None);
    };
    let history = earlier
        .chunks(2)
        .map(|pair| {
            let request = pair[0].text();
            let response = pair.get(1).map(ChatMessage::text).unwrap_or_default();
            HistoryTurn::new(request, response)
        })
        .collect();
    (history, Some(live))
}

pub fn detect_language(query: &str) -> &'static str {
    let lower = query.to_lowercase();
    LANGUAGES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, lang)| *lang)
        .unwrap_or(DEFAULT_LANG)
}

/// Hex SHA-256 of the current Unix time in nanoseconds.
pub fn checkpoint_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    hex::encode(Sha256::digest(nanos.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str, messages: &[(&str, &str)]) -> ChatCompletionRequest {
        let messages = messages
            .iter()
            .map(|(role, content)| {
                serde_json::json!({ "role": role, "content": content })
            })
            .collect::<Vec<_>>();
        serde_json::from_value(serde_json::json!({ "model": model, "messages": messages })).unwrap()
    }

    #[test]
    fn test_agent_history_and_live_message() {
        let up = to_upstream(&request(
            "claude-3.7",
            &[("user", "a"), ("assistant", "b"), ("user", "c")],
        ));

        assert_eq!(up.mode, "AGENT");
        assert_eq!(up.chat_history.len(), 1);
        assert_eq!(up.chat_history[0].request_message, "a");
        assert_eq!(up.chat_history[0].response_text, "b");
        assert_eq!(up.chat_history[0].response_nodes[0].content, "b");
        assert_eq!(up.message, format!("{NO_MUTATION_PROMPT}\nc"));
        assert_eq!(up.tool_definitions.len(), 9);
    }

    #[test]
    fn test_chat_mode_has_no_tools_or_prompt() {
        let up = to_upstream(&request("Augment-Chat", &[("user", "hi")]));
        assert_eq!(up.mode, "CHAT");
        assert_eq!(up.message, "hi");
        assert!(up.tool_definitions.is_empty());
        assert!(up.chat_history.is_empty());
    }

    #[test]
    fn test_odd_prefix_keeps_dangling_turn_with_empty_response_instead_of_pairing_live() {
        let up = to_upstream(&request(
            "augment-chat",
            &[("system", "be brief"), ("user", "a"), ("assistant", "b"), ("user", "c")],
        ));
        assert_eq!(up.chat_history.len(), 2);
        assert_eq!(up.chat_history[1].request_message, "b");
        assert_eq!(up.chat_history[1].response_text, "");
        assert_eq!(up.message, "c");
    }

    #[test]
    fn test_empty_messages() {
        let up = to_upstream(&request("x-agent", &[]));
        assert_eq!(up.message, format!("{NO_MUTATION_PROMPT}\n"));
        assert_eq!(up.lang, "HTML");
    }

    #[test]
    fn test_detect_language_priority() {
        assert_eq!(detect_language("Write HTML and Python"), "HTML");
        assert_eq!(detect_language("a python script"), "Python");
        // "go" is checked before "rust" and matches inside other words.
        assert_eq!(detect_language("good rust code"), "Go");
        assert_eq!(detect_language("rust traits"), "Rust");
        assert_eq!(detect_language("in c"), "C");
        assert_eq!(detect_language("你好"), "HTML");
        assert_eq!(detect_language(""), "HTML");
    }

    #[test]
    fn test_checkpoint_id_is_hex_sha256() {
        let id = checkpoint_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_upstream_body_field_names() {
        let v = serde_json::to_value(to_upstream(&request("augment-chat", &[("user", "q")]))).unwrap();
        for field in [
            "chat_history",
            "message",
            "agent_memories",
            "mode",
            "prefix",
            "suffix",
            "lang",
            "path",
            "user_guidelines",
            "blobs",
            "user_guided_blobs",
            "external_source_ids",
            "feature_detection_flags",
            "tool_definitions",
            "nodes",
        ] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(v["feature_detection_flags"]["support_raw_output"], true);
    }
}
