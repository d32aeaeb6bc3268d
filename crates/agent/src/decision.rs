//! The two pure decision rules the agent's per-turn pipeline relies on: the
//! **creation decision** (should this turn trigger a generation at all) and
//! the **mode selection** (which of the five generation modes to run). Both are
//! plain functions over already-computed inputs, kept free of I/O so they
//! are exhaustively unit-testable — the same "pure function at the
//! decision seam" shape the rule stage of `quill-intent` uses.

use quill_intent::Intent;
use quill_memory::GenerationMode;

const GENERATION_CUES: &[&str] =
    &["write chapter", "generate chapter", "write it", "go ahead", "start writing", "let's write it"];

pub fn contains_generation_cue(text: &str) -> bool {
    let lower = text.to_lowercase();
    GENERATION_CUES.iter().any(|cue| lower.contains(cue))
}

/// `generate when (intent ∈ {GENERATE_CONTENT, CONTINUE_CONTENT}) OR
/// (completeness ≥ completion_threshold AND consistency ≥
/// consistency_threshold AND the last turn contains generation cues).
/// Otherwise respond conversationally.` Thresholds are read from
/// `AppConfig`'s `completion_threshold`/`consistency_threshold` rather than
/// hardcoded, so a deployment can retune them without a code change.
pub fn creation_decision(
    intent: Intent,
    completeness_score: f32,
    consistency_score: f32,
    last_turn_text: &str,
    completion_threshold: f32,
    consistency_threshold: f32,
) -> bool {
    if matches!(intent, Intent::GenerateContent | Intent::ContinueContent) {
        return true;
    }
    completeness_score >= completion_threshold
        && consistency_score >= consistency_threshold
        && contains_generation_cue(last_turn_text)
}

const CONTINUE_CUES: &[&str] = &["continue", "next chapter", "keep going", "what happens next"];
const REWRITE_CUES: &[&str] = &["rewrite", "redo", "revise"];

/// The chapter number an instruction targets, parsed from `"chapter N"`
/// (case-insensitive). Returns `None` when no such phrase is present.
pub fn target_chapter_number(text: &str) -> Option<u32> {
    let lower = text.to_lowercase();
    let pos = lower.find("chapter ")?;
    let rest = &lower[pos + "chapter ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// A scope locator like `"chapter 4 paragraph 2"`: the targeted chapter
/// plus, when present, the paragraph within it.
pub fn scope_locator(text: &str) -> Option<(u32, Option<u32>)> {
    let chapter = target_chapter_number(text)?;
    let lower = text.to_lowercase();
    let paragraph = lower.find("paragraph ").and_then(|pos| {
        let rest = &lower[pos + "paragraph ".len()..];
        rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok()
    });
    Some((chapter, paragraph))
}

/// `CONTINUE if a current chapter exists and user said "next/continue";
/// REWRITE if user targeted an existing chapter; EXPAND if a scope locator
/// like "chapter 4 paragraph 2" is found; else FULL.`
pub fn select_mode(text: &str, current_chapter_exists: bool) -> GenerationMode {
    let lower = text.to_lowercase();

    if current_chapter_exists && CONTINUE_CUES.iter().any(|cue| lower.contains(cue)) {
        return GenerationMode::Continue;
    }
    if scope_locator(text).map(|(_, paragraph)| paragraph.is_some()).unwrap_or(false) {
        return GenerationMode::Expand;
    }
    if REWRITE_CUES.iter().any(|cue| lower.contains(cue)) && target_chapter_number(text).is_some() {
        return GenerationMode::Rewrite;
    }
    GenerationMode::Full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_generate_intent_always_triggers_generation() {
        assert!(creation_decision(Intent::GenerateContent, 0.0, 0.0, "anything", 0.7, 0.5));
        assert!(creation_decision(Intent::ContinueContent, 0.0, 0.0, "anything", 0.7, 0.5));
    }

    #[test]
    fn high_completeness_with_generation_cue_triggers_generation() {
        assert!(creation_decision(Intent::Chat, 0.75, 0.6, "ok, write it", 0.7, 0.5));
    }

    #[test]
    fn high_completeness_without_cue_does_not_trigger_generation() {
        assert!(!creation_decision(Intent::CreateStory, 0.9, 0.9, "I want a 2077 Shanghai cyberpunk novel", 0.7, 0.5));
    }

    #[test]
    fn mode_selection_picks_continue_when_a_current_chapter_exists() {
        assert_eq!(select_mode("continue", true), GenerationMode::Continue);
        assert_eq!(select_mode("continue", false), GenerationMode::Full);
    }

    #[test]
    fn mode_selection_picks_rewrite_for_a_targeted_existing_chapter() {
        assert_eq!(select_mode("rewrite chapter 4 with a cliffhanger ending", false), GenerationMode::Rewrite);
    }

    #[test]
    fn mode_selection_picks_expand_for_a_scope_locator() {
        assert_eq!(select_mode("expand chapter 4 paragraph 2", false), GenerationMode::Expand);
    }

    #[test]
    fn scope_locator_parses_chapter_and_paragraph() {
        assert_eq!(scope_locator("chapter 4 paragraph 2"), Some((4, Some(2))));
        assert_eq!(scope_locator("chapter 4"), Some((4, None)));
        assert_eq!(scope_locator("no locator here"), None);
    }
}
