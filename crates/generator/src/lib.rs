//! The content generator: five modes, deterministic prompt
//! composition (`crate::prompt`), the token-budget rule, post-generation
//! consistency re-check and plot summarization, `settings_fingerprint`, and
//! the chapter lifecycle state machine.

mod prompt;
mod wordcount;

pub use prompt::{GenerationInputs, build_generation_prompt};
pub use wordcount::word_count;

use chrono::Utc;
use quill_consistency::check_chapter;
use quill_llm::{ChatMessage, LlmError, LlmGateway, LlmRequest};
use quill_memory::{
    ChapterState, CharacterProfile, ConsistencyReport, ExtractedSettingsBundle, GenerationMode, GenerationRecord,
    MemoryItem, MemoryTier,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("prompt cannot fit even at the lowest retrieval budget")]
    ContextOverflow,
}

/// Prompt ≤60% of the model's context window, completion ≤35%, 5% slack.
const PROMPT_BUDGET_SHARE: f32 = 0.60;
const COMPLETION_BUDGET_SHARE: f32 = 0.35;
const DEFAULT_RETRIEVAL_K: usize = 8;
/// `build_context` is re-run at a tighter budget/lower k this many times
/// before giving up with `ContextOverflow`.
const MAX_BUDGET_RETRIES: u32 = 4;
const MAX_SUMMARY_WORDS: usize = 200;

pub struct GenerationRequest<'a> {
    pub project_id: String,
    pub chapter_number: u32,
    pub mode: GenerationMode,
    pub settings: &'a ExtractedSettingsBundle,
    pub memory_items: &'a [MemoryItem],
    pub target_length: Option<usize>,
    pub constraints: Option<String>,
    pub previous_content: Option<String>,
    pub parent_id: Option<Uuid>,
    /// Whether this is the story's resolution chapter: an explicit
    /// caller-supplied flag, never inferred from generated text.
    pub resolution: bool,
    pub context_window: usize,
    pub generation_max_tokens: usize,
}

pub struct GenerationOutput {
    pub record: GenerationRecord,
    pub report: ConsistencyReport,
    /// A ≤200-word chapter summary, ready to be appended to PLOT memory by
    /// the caller as part of its end-of-turn atomic commit (this crate
    /// never writes to memory itself).
    pub plot_summary: String,
}

fn expected_characters<'a>(settings: &'a ExtractedSettingsBundle, text_hint: Option<&str>) -> Vec<&'a CharacterProfile> {
    match text_hint {
        Some(hint) => {
            let lower = hint.to_lowercase();
            let matched: Vec<&CharacterProfile> = settings.characters.iter().filter(|c| lower.contains(&c.name.to_lowercase())).collect();
            if matched.is_empty() {
                settings.characters.iter().collect()
            } else {
                matched
            }
        }
        None => settings.characters.iter().collect(),
    }
}

/// Builds the prompt under the token-budget rule: retrieval budget/`k`
/// shrink each retry until the assembled prompt fits `PROMPT_BUDGET_SHARE`
/// of `context_window`, or `MAX_BUDGET_RETRIES` is exhausted.
fn compose_prompt_with_budget(
    request: &GenerationRequest<'_>,
    gateway: &LlmGateway,
) -> Result<String, GeneratorError> {
    let prompt_budget = (request.context_window as f32 * PROMPT_BUDGET_SHARE) as usize;
    let expected = expected_characters(request.settings, request.constraints.as_deref());
    let mut k = DEFAULT_RETRIEVAL_K;
    let mut memory_budget = prompt_budget;

    for attempt in 0..MAX_BUDGET_RETRIES {
        let memory_context = quill_memory::build_context(
            request.memory_items,
            request.constraints.as_deref().unwrap_or(""),
            memory_budget,
            None,
            k,
            |text| gateway.count_tokens(text),
        );

        let inputs = GenerationInputs {
            mode: request.mode,
            settings: request.settings,
            expected_characters: expected.clone(),
            memory_context: &memory_context,
            target_length: request.target_length,
            constraints: request.constraints.as_deref(),
            previous_content: request.previous_content.as_deref(),
            chapter_number: request.chapter_number,
        };
        let prompt = build_generation_prompt(&inputs);
        let prompt_tokens = gateway.count_tokens(&prompt);

        if prompt_tokens <= prompt_budget {
            return Ok(prompt);
        }
        tracing::warn!(attempt, prompt_tokens, prompt_budget, k, "prompt over budget, shrinking retrieval");
        k = (k / 2).max(1);
        memory_budget = (memory_budget / 2).max(1);
    }

    Err(GeneratorError::ContextOverflow)
}

/// Runs one generation: builds the budget-bounded prompt, calls the
/// gateway, computes `word_count`, re-checks consistency against the new
/// text, and summarizes the chapter into a ≤200-word PLOT-ready string.
/// Completion is capped at `min(generation_max_tokens, context_window *
/// 35%)`. The record returned is already `CURRENT` — acceptance in this
/// engine is automatic on a successful generation, with no separate
/// user-facing accept step; `REWRITE` sets `parent_id` to the
/// chapter it replaces and the caller's chapter repository demotes the
/// prior CURRENT record to HISTORY via `set_current`.
pub async fn generate(gateway: &LlmGateway, request: GenerationRequest<'_>) -> Result<GenerationOutput, GeneratorError> {
    let prompt = compose_prompt_with_budget(&request, gateway)?;

    let completion_budget = ((request.context_window as f32 * COMPLETION_BUDGET_SHARE) as usize).min(request.generation_max_tokens);
    let llm_request = LlmRequest {
        messages: vec![ChatMessage::user(&prompt)],
        temperature: 0.9,
        max_tokens: completion_budget,
        ..Default::default()
    };

    let response = match gateway.generate(&llm_request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, project_id = %request.project_id, chapter_number = request.chapter_number, "chapter generation failed");
            return Err(err.into());
        }
    };

    let word_count_value = word_count(&response.content);
    let report = check_chapter(request.settings, &response.content, request.resolution);
    let plot_summary = summarize_chapter(gateway, &response.content).await.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "chapter summarization failed, falling back to a truncated excerpt");
        truncate_to_words(&response.content, MAX_SUMMARY_WORDS)
    });

    let record = GenerationRecord {
        id: Uuid::new_v4(),
        project_id: request.project_id,
        chapter_number: request.chapter_number,
        mode: request.mode,
        content: response.content,
        word_count: word_count_value,
        parent_id: request.parent_id,
        state: ChapterState::Current,
        created_at: Utc::now(),
        settings_fingerprint: request.settings.fingerprint(),
    };

    Ok(GenerationOutput { record, report, plot_summary })
}

const SUMMARY_SYSTEM_PROMPT: &str =
    "Summarize the following chapter in 200 words or fewer, focused on plot-relevant events only. \
     Respond with only the summary text.";

async fn summarize_chapter(gateway: &LlmGateway, chapter_text: &str) -> Result<String, LlmError> {
    let request = LlmRequest {
        messages: vec![ChatMessage::system(SUMMARY_SYSTEM_PROMPT), ChatMessage::user(chapter_text)],
        temperature: 0.3,
        max_tokens: 400,
        ..Default::default()
    };
    let response = gateway.generate(&request).await?;
    Ok(truncate_to_words(&response.content, MAX_SUMMARY_WORDS))
}

fn truncate_to_words(text: &str, max_words: usize) -> String {
    text.split_whitespace().take(max_words).collect::<Vec<_>>().join(" ")
}

/// Wraps a completed generation's summary as a memory item ready for the
/// caller to append to PLOT memory as part of the turn's atomic commit.
pub fn plot_summary_memory_item(project_id: &str, chapter_number: u32, summary: &str) -> MemoryItem {
    MemoryItem::new(MemoryTier::Plot, summary.to_string())
        .with_metadata("project_id", project_id)
        .with_metadata("chapter_number", chapter_number.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_llm::MockProvider;
    use quill_memory::{CharacterRole, PlotKind, PlotPoint};

    fn bundle_with_protagonist() -> ExtractedSettingsBundle {
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.characters.push(CharacterProfile::new("Lin Feng", CharacterRole::Protagonist));
        bundle.plot_points.push(PlotPoint {
            chapter_hint: Some(1),
            summary: "Lin Feng begins the hunt for the missing AI".to_string(),
            kind: PlotKind::Setup,
            involved_characters: vec!["Lin Feng".to_string()],
            resolved: false,
        });
        bundle
    }

    #[tokio::test]
    async fn full_generation_produces_a_current_record_with_positive_word_count() {
        let gateway = LlmGateway::new(Box::new(MockProvider::echo()));
        let settings = bundle_with_protagonist();
        let request = GenerationRequest {
            project_id: "p1".to_string(),
            chapter_number: 1,
            mode: GenerationMode::Full,
            settings: &settings,
            memory_items: &[],
            target_length: Some(1000),
            constraints: None,
            previous_content: None,
            parent_id: None,
            resolution: false,
            context_window: 8192,
            generation_max_tokens: 3500,
        };
        let output = generate(&gateway, request).await.unwrap();
        assert_eq!(output.record.state, ChapterState::Current);
        assert!(output.record.word_count > 0);
        assert!(!output.record.settings_fingerprint.is_empty());
    }

    #[tokio::test]
    async fn continue_mode_carries_parent_and_prior_content_seed() {
        let gateway = LlmGateway::new(Box::new(MockProvider::echo()));
        let settings = bundle_with_protagonist();
        let parent = Uuid::new_v4();
        let request = GenerationRequest {
            project_id: "p1".to_string(),
            chapter_number: 2,
            mode: GenerationMode::Continue,
            settings: &settings,
            memory_items: &[],
            target_length: None,
            constraints: None,
            previous_content: Some("chapter one ended on a cliffhanger".to_string()),
            parent_id: Some(parent),
            resolution: false,
            context_window: 8192,
            generation_max_tokens: 3500,
        };
        let output = generate(&gateway, request).await.unwrap();
        assert_eq!(output.record.parent_id, Some(parent));
        assert_eq!(output.record.chapter_number, 2);
    }

    #[tokio::test]
    async fn llm_failure_is_propagated_as_generator_error() {
        let gateway = LlmGateway::new(Box::new(MockProvider::always_fail(LlmError::Auth)));
        let settings = ExtractedSettingsBundle::default();
        let request = GenerationRequest {
            project_id: "p1".to_string(),
            chapter_number: 1,
            mode: GenerationMode::Full,
            settings: &settings,
            memory_items: &[],
            target_length: None,
            constraints: None,
            previous_content: None,
            parent_id: None,
            resolution: false,
            context_window: 8192,
            generation_max_tokens: 3500,
        };
        let result = generate(&gateway, request).await;
        assert!(matches!(result, Err(GeneratorError::Llm(LlmError::Auth))));
    }

    #[test]
    fn plot_summary_memory_item_lands_in_plot_tier() {
        let item = plot_summary_memory_item("p1", 3, "a short summary");
        assert_eq!(item.level, MemoryTier::Plot);
        assert_eq!(item.metadata.get("chapter_number").map(String::as_str), Some("3"));
    }
}
