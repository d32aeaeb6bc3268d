//! The setting extractor and completer: derive/refine the
//! extracted-settings bundle after every turn, without ever asking the user
//! to fill out forms.
//!
//! Pipeline: extract candidate fragments -> merge into the bundle via the
//! closed `SettingEdit` union -> check completeness -> complete missing
//! slots via the LLM gateway (tolerant JSON parsing, two-failure swallow) ->
//! delegate conflict checking to `quill-consistency` and roll back any
//! field an ERROR issue implicates.

use quill_consistency::check_settings_change;
use quill_llm::{ChatMessage, LlmGateway, LlmRequest};
use quill_memory::{
    CharacterRole, ConsistencyIssue, ConsistencyReport, ExtractedSettingsBundle, IssueSeverity, PlotKind, PlotPoint,
    SettingEdit, WorldField,
};
use serde::Deserialize;
use thiserror::Error;

mod extract;

pub use extract::extract_candidate_edits;

#[derive(Debug, Error)]
pub enum SettingError {
    #[error("llm completion call failed: {0}")]
    Llm(#[from] quill_llm::LlmError),
}

/// Step 3: a boolean vector over the required setting slots, plus a
/// weighted completeness score.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completeness {
    pub has_protagonist: bool,
    pub has_conflict: bool,
    pub has_genre: bool,
    pub has_location: bool,
    pub score: f32,
}

const SLOT_WEIGHT: f32 = 0.25;

pub fn assess_completeness(bundle: &ExtractedSettingsBundle) -> Completeness {
    let has_protagonist = bundle.characters.iter().any(|c| c.role == CharacterRole::Protagonist);
    let has_conflict = !bundle.plot_points.is_empty();
    let has_genre = !bundle.world.genre.is_empty();
    let has_location = !bundle.world.locations.is_empty();
    let score = [has_protagonist, has_conflict, has_genre, has_location]
        .iter()
        .filter(|&&present| present)
        .count() as f32
        * SLOT_WEIGHT;
    Completeness { has_protagonist, has_conflict, has_genre, has_location, score }
}

/// Step 4's LLM-completion output shape: compact, tolerantly-parsed JSON
/// naming only the slots `assess_completeness` found missing.
#[derive(Debug, Default, Deserialize)]
struct SettingCompletion {
    #[serde(default)]
    protagonist_name: Option<String>,
    #[serde(default)]
    protagonist_traits: Vec<String>,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    conflict_summary: Option<String>,
}

/// A tolerant-parsing idiom for LLM JSON output: a fenced ```json block
/// first, then a brace-balanced bare-object scan as a fallback.
fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }
    None
}

const COMPLETION_SYSTEM_PROMPT: &str = "You fill in missing story-setting slots for a fiction \
authoring assistant. Given the current known settings, respond with ONLY a compact JSON object \
naming just the slots asked for, e.g. {\"genre\":\"cyberpunk\",\"location\":\"Shanghai\"}. \
Never invent a protagonist name if one is already known.";

fn build_completion_prompt(bundle: &ExtractedSettingsBundle, completeness: Completeness) -> String {
    let mut missing = Vec::new();
    if !completeness.has_protagonist {
        missing.push("protagonist_name, protagonist_traits");
    }
    if !completeness.has_conflict {
        missing.push("conflict_summary");
    }
    if !completeness.has_genre {
        missing.push("genre");
    }
    if !completeness.has_location {
        missing.push("location");
    }
    format!(
        "Known so far: genre={genre:?}, locations={locations:?}, characters={characters:?}.\n\
         Missing slots to fill: {missing}.\n\
         Respond with only the JSON object.",
        genre = bundle.world.genre,
        locations = bundle.world.locations,
        characters = bundle.characters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        missing = missing.join(", "),
    )
}

fn completion_to_edits(completion: SettingCompletion) -> Vec<SettingEdit> {
    let mut edits = Vec::new();
    if let Some(name) = completion.protagonist_name {
        edits.push(SettingEdit::UpsertCharacter {
            name: name.clone(),
            role: Some(CharacterRole::Protagonist),
            background: None,
            ai_generated: true,
        });
        for trait_name in completion.protagonist_traits {
            edits.push(SettingEdit::AddTrait { character: name.clone(), trait_name });
        }
    }
    if let Some(genre) = completion.genre {
        edits.push(SettingEdit::UpsertWorldField { field: WorldField::Genre, value: genre });
    }
    if let Some(location) = completion.location {
        edits.push(SettingEdit::AddLocation { location });
    }
    if let Some(summary) = completion.conflict_summary {
        edits.push(SettingEdit::AddPlotPoint {
            point: PlotPoint {
                chapter_hint: None,
                summary,
                kind: PlotKind::Setup,
                involved_characters: Vec::new(),
                resolved: false,
            },
        });
    }
    edits
}

/// Step 4: attempts LLM completion of the missing slots up to twice with
/// fresh prompts; a `PARSE` failure on both attempts is swallowed (keep
/// prior state, log) rather than aborting the turn.
pub async fn complete_missing_slots(
    gateway: &LlmGateway,
    bundle: &ExtractedSettingsBundle,
    completeness: Completeness,
) -> Result<Vec<SettingEdit>, SettingError> {
    if completeness.score >= 1.0 {
        return Ok(Vec::new());
    }

    let prompt = build_completion_prompt(bundle, completeness);
    for attempt in 1..=2u8 {
        let request = LlmRequest {
            messages: vec![ChatMessage::system(COMPLETION_SYSTEM_PROMPT), ChatMessage::user(&prompt)],
            temperature: 0.4,
            max_tokens: 256,
            ..Default::default()
        };
        let response = gateway.generate(&request).await?;
        match extract_json_output::<SettingCompletion>(&response.content) {
            Some(completion) => return Ok(completion_to_edits(completion)),
            None => {
                tracing::warn!(attempt, "setting completion response did not parse as JSON, retrying");
            }
        }
    }
    tracing::warn!("setting completion failed twice, keeping prior state");
    Ok(Vec::new())
}

/// The outcome of running the full per-turn pipeline once.
pub struct TurnExtractionOutcome {
    pub bundle: ExtractedSettingsBundle,
    pub report: ConsistencyReport,
    /// Internal notes surfaced when an ERROR conflict was found; a
    /// role-contradiction note means the implicated field was rolled back,
    /// a world-rule-conflict note means the user's latest statement was
    /// kept and the conflict was recorded instead. Never silently dropped,
    /// never blocking the turn either.
    pub conflict_notes: Vec<String>,
}

/// Step 5: delegates conflict-checking to `quill-consistency`. A
/// role-contradiction ERROR rolls the implicated character's role back to
/// its value in `previous`. A world-rule-contradiction ERROR does not roll
/// anything back — the user's latest statement about the world is kept as
/// given, and the conflict is instead recorded as an additional INFO issue
/// on the returned report, so the turn can still surface it and ask for
/// clarification without discarding what the user just said.
pub fn check_and_rollback_conflicts(
    previous: &ExtractedSettingsBundle,
    mut candidate: ExtractedSettingsBundle,
) -> (ExtractedSettingsBundle, ConsistencyReport, Vec<String>) {
    let report = check_settings_change(previous, &candidate);
    let mut notes = Vec::new();
    let mut extra_issues = Vec::new();

    for issue in report.issues.iter().filter(|i| i.severity == IssueSeverity::Error) {
        match issue.kind.as_str() {
            "role-contradiction" => {
                if let Some(prior_character) = previous.characters.iter().find(|c| c.name == issue.locus) {
                    if let Some(current) = candidate.characters.iter_mut().find(|c| c.name == issue.locus) {
                        current.role = prior_character.role;
                        notes.push(format!("rolled back {}'s role after a contradiction: {}", issue.locus, issue.description));
                    }
                }
            }
            "world-rule-contradiction" => {
                notes.push(format!("kept your latest statement about the world; flagged the conflict instead of rolling it back: {}", issue.description));
                extra_issues.push(ConsistencyIssue {
                    kind: "world-rule-conflict-noted".to_string(),
                    severity: IssueSeverity::Info,
                    locus: issue.locus.clone(),
                    description: format!("kept the user's latest statement despite a conflict: {}", issue.description),
                });
            }
            _ => {}
        }
    }

    let report = if extra_issues.is_empty() {
        report
    } else {
        let mut issues = report.issues;
        issues.extend(extra_issues);
        ConsistencyReport::from_issues(issues)
    };

    (candidate, report, notes)
}

/// Runs the full pipeline for one turn: extract, merge, complete, conflict-
/// check-and-rollback. Extraction never blocks the conversational response
/// — any LLM failure during completion is propagated as `SettingError` so
/// the caller can decide to proceed anyway (the caller, `quill-agent`,
/// treats an `Err` here as "skip completion, keep the bundle as
/// extracted").
pub async fn process_turn(
    gateway: &LlmGateway,
    previous: &ExtractedSettingsBundle,
    turn_text: &str,
) -> Result<TurnExtractionOutcome, SettingError> {
    let edits = extract_candidate_edits(turn_text);
    let mut candidate = previous.clone();
    candidate.apply_edits(edits);

    let completeness = assess_completeness(&candidate);
    let completion_edits = complete_missing_slots(gateway, &candidate, completeness).await?;
    candidate.apply_edits(completion_edits);

    let (bundle, report, conflict_notes) = check_and_rollback_conflicts(previous, candidate);
    Ok(TurnExtractionOutcome { bundle, report, conflict_notes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_llm::{LlmError, MockProvider};

    #[test]
    fn completeness_score_accumulates_one_quarter_per_slot() {
        let mut bundle = ExtractedSettingsBundle::default();
        assert_eq!(assess_completeness(&bundle).score, 0.0);
        bundle.world.genre = "cyberpunk".to_string();
        assert_eq!(assess_completeness(&bundle).score, SLOT_WEIGHT);
    }

    #[test]
    fn extract_json_output_parses_fenced_block() {
        let raw = "sure, here:\n```json\n{\"genre\":\"cyberpunk\"}\n```\nhope that helps";
        let parsed: SettingCompletion = extract_json_output(raw).unwrap();
        assert_eq!(parsed.genre.as_deref(), Some("cyberpunk"));
    }

    #[test]
    fn extract_json_output_parses_bare_braces() {
        let raw = "{\"location\":\"Shanghai\"}";
        let parsed: SettingCompletion = extract_json_output(raw).unwrap();
        assert_eq!(parsed.location.as_deref(), Some("Shanghai"));
    }

    #[tokio::test]
    async fn unparseable_completion_is_swallowed_after_two_attempts() {
        let gateway = LlmGateway::new(Box::new(MockProvider::echo()));
        let bundle = ExtractedSettingsBundle::default();
        let completeness = assess_completeness(&bundle);
        let edits = complete_missing_slots(&gateway, &bundle, completeness).await.unwrap();
        assert!(edits.is_empty());
    }

    #[tokio::test]
    async fn llm_failure_propagates_as_setting_error() {
        let gateway = LlmGateway::new(Box::new(MockProvider::always_fail(LlmError::ProviderError("down".into()))))
            .with_retry_policy(quill_llm::RetryPolicy { max_attempts: 1, ..Default::default() });
        let bundle = ExtractedSettingsBundle::default();
        let completeness = assess_completeness(&bundle);
        let result = complete_missing_slots(&gateway, &bundle, completeness).await;
        assert!(result.is_err());
    }

    #[test]
    fn role_contradiction_is_rolled_back_with_a_note() {
        use quill_memory::CharacterProfile;
        let mut previous = ExtractedSettingsBundle::default();
        previous.characters.push(CharacterProfile::new("Lin Feng", CharacterRole::Protagonist));
        let mut candidate = previous.clone();
        candidate.characters[0].role = CharacterRole::Antagonist;

        let (rolled_back, report, notes) = check_and_rollback_conflicts(&previous, candidate);
        assert_eq!(rolled_back.characters[0].role, CharacterRole::Protagonist);
        assert!(report.has_errors());
        assert_eq!(notes.len(), 1);
    }

    #[tokio::test]
    async fn process_turn_extracts_and_merges_a_new_protagonist() {
        let gateway = LlmGateway::new(Box::new(MockProvider::echo()));
        let previous = ExtractedSettingsBundle::default();
        let outcome = process_turn(
            &gateway,
            &previous,
            "I want a 2077 Shanghai cyberpunk novel, protagonist Lin Feng, ex-detective hunting a missing AI",
        )
        .await
        .unwrap();

        assert!(outcome.bundle.characters.iter().any(|c| c.name == "Lin Feng" && c.role == CharacterRole::Protagonist));
        assert_eq!(outcome.bundle.world.genre, "cyberpunk");
        assert!(outcome.bundle.world.locations.iter().any(|l| l == "Shanghai"));
    }
}
