//! The intent recognizer: a two-stage classifier over the
//! closed set of turn intents. A fast rule stage matches keyword patterns
//! and yields a confidence in `[0,1]`; below 0.6 the LLM gateway is asked to
//! pick a single label from the same closed set. Stateless between turns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_llm::{ChatMessage, LlmError, LlmGateway, LlmRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CreateStory,
    ModifySetting,
    ModifyContent,
    Query,
    GenerateContent,
    ContinueContent,
    Chat,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::CreateStory,
        Intent::ModifySetting,
        Intent::ModifyContent,
        Intent::Query,
        Intent::GenerateContent,
        Intent::ContinueContent,
        Intent::Chat,
    ];

    fn label(&self) -> &'static str {
        match self {
            Intent::CreateStory => "create_story",
            Intent::ModifySetting => "modify_setting",
            Intent::ModifyContent => "modify_content",
            Intent::Query => "query",
            Intent::GenerateContent => "generate_content",
            Intent::ContinueContent => "continue_content",
            Intent::Chat => "chat",
        }
    }

    fn from_label(label: &str) -> Option<Intent> {
        let label = label.trim().trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_lowercase();
        Intent::ALL.into_iter().find(|i| i.label() == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f32,
    pub rationale: String,
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("llm fallback classification failed: {0}")]
    Llm(#[from] LlmError),
}

/// Below this confidence, the rule stage's candidate is not trusted and the
/// LLM fallback is consulted instead.
pub const CONFIDENCE_FALLBACK_THRESHOLD: f32 = 0.6;

/// Pure-function rule stage: keyword-pattern matching with no async
/// machinery, so it is trivially unit-testable on its own (mirrors the
/// teacher's preference for a pure-function core wherever a classification
/// step is naturally deterministic).
pub fn classify_by_rules(text: &str) -> (Intent, f32, &'static str) {
    let lower = text.to_lowercase();

    const CREATE_STORY: &[&str] = &["i want to write", "new story", "new novel", "let's write a", "start a story", "start a new book"];
    const GENERATE: &[&str] = &["write chapter", "generate chapter", "write the next chapter", "write it"];
    const CONTINUE: &[&str] = &["continue", "next chapter", "keep going", "what happens next"];
    const MODIFY_CONTENT: &[&str] = &["rewrite chapter", "rewrite the", "redo chapter", "revise chapter", "cliffhanger ending", "expand chapter", "expand paragraph"];
    const MODIFY_SETTING: &[&str] = &["make the protagonist", "change the", "rename", "there's no", "there is no", "actually", "instead of"];
    const QUERY: &[&str] = &["what is", "who is", "remind me", "summarize", "what happened", "recap"];

    if CREATE_STORY.iter().any(|p| lower.contains(p)) {
        return (Intent::CreateStory, 0.85, "matched create-story keyword pattern");
    }
    if MODIFY_CONTENT.iter().any(|p| lower.contains(p)) {
        return (Intent::ModifyContent, 0.85, "matched modify-content keyword pattern");
    }
    if GENERATE.iter().any(|p| lower.contains(p)) {
        return (Intent::GenerateContent, 0.85, "matched generate-content keyword pattern");
    }
    if CONTINUE.iter().any(|p| lower.contains(p)) {
        return (Intent::ContinueContent, 0.8, "matched continue-content keyword pattern");
    }
    if MODIFY_SETTING.iter().any(|p| lower.contains(p)) {
        return (Intent::ModifySetting, 0.7, "matched modify-setting keyword pattern");
    }
    if QUERY.iter().any(|p| lower.contains(p)) {
        return (Intent::Query, 0.7, "matched query keyword pattern");
    }

    (Intent::Chat, 0.4, "no keyword pattern matched, defaulting to chat with low confidence")
}

const FALLBACK_SYSTEM_PROMPT: &str = "You classify a single user turn in a fiction-writing \
assistant into exactly one label from this closed set: create_story, modify_setting, \
modify_content, query, generate_content, continue_content, chat. Respond with only the label, \
nothing else.";

/// Two-stage classification: rules first, LLM fallback when confidence is
/// below threshold. Stateless — callers pass the text for one turn only.
pub async fn recognize(gateway: &LlmGateway, text: &str) -> Result<IntentResult, IntentError> {
    let (intent, confidence, rationale) = classify_by_rules(text);
    if confidence >= CONFIDENCE_FALLBACK_THRESHOLD {
        return Ok(IntentResult { intent, confidence, rationale: rationale.to_string() });
    }

    let request = LlmRequest {
        messages: vec![ChatMessage::system(FALLBACK_SYSTEM_PROMPT), ChatMessage::user(text)],
        temperature: 0.0,
        max_tokens: 16,
        ..Default::default()
    };

    let response = gateway.generate(&request).await?;
    match Intent::from_label(&response.content) {
        Some(llm_intent) => Ok(IntentResult {
            intent: llm_intent,
            confidence: 0.75,
            rationale: "rule stage confidence was low, llm fallback classified".to_string(),
        }),
        None => {
            tracing::debug!(raw = %response.content, "intent fallback returned an unrecognized label, keeping rule candidate");
            Ok(IntentResult { intent, confidence, rationale: rationale.to_string() })
        }
    }
}
