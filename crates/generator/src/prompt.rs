//! Pure prompt assembly: a `GenerationInputs<'a>` struct feeding a pure
//! `build_generation_prompt` function that delegates to private per-block
//! builders, one block per composition section. Same deterministic,
//! unit-testable shape as a typical chat-prompt builder (`PromptInputs` +
//! private `build_*_block` functions), with a different block set and
//! budget math.

use quill_memory::{CharacterProfile, ExtractedSettingsBundle, GenerationMode};

pub struct GenerationInputs<'a> {
    pub mode: GenerationMode,
    pub settings: &'a ExtractedSettingsBundle,
    pub expected_characters: Vec<&'a CharacterProfile>,
    pub memory_context: &'a str,
    pub target_length: Option<usize>,
    pub constraints: Option<&'a str>,
    pub previous_content: Option<&'a str>,
    pub chapter_number: u32,
}

/// Assembles the full prompt in block order: System, World, Character,
/// Memory, Task, and (for CONTINUE/REWRITE/EXPAND) a Continuation seed.
pub fn build_generation_prompt(inputs: &GenerationInputs<'_>) -> String {
    let system = build_system_block(inputs.settings);
    let world = build_world_block(inputs.settings);
    let character = build_character_block(&inputs.expected_characters);
    let memory = build_memory_block(inputs.memory_context);
    let task = build_task_block(inputs);
    let continuation = build_continuation_seed_block(inputs);

    format!(
        "{system}\n\n\
         WORLD:\n{world}\n\n\
         CHARACTERS:\n{character}\n\n\
         MEMORY CONTEXT:\n{memory}\n\n\
         TASK:\n{task}{continuation}"
    )
}

fn build_system_block(settings: &ExtractedSettingsBundle) -> String {
    let pov = settings.style_hints.get("pov").map(String::as_str).unwrap_or("third person limited");
    let tense = settings.style_hints.get("tense").map(String::as_str).unwrap_or("past");
    let tone = settings.style_hints.get("tone").map(String::as_str).unwrap_or("unspecified");
    let pacing = settings.style_hints.get("pacing").map(String::as_str).unwrap_or("unspecified");

    format!(
        "You are a professional long-form fiction author. Write in {pov} point of view, {tense} \
         tense. Tone: {tone}. Pacing: {pacing}. Stay consistent with every fact given below; never \
         contradict an established character, location, or rule."
    )
}

fn build_world_block(settings: &ExtractedSettingsBundle) -> String {
    let world = &settings.world;
    format!(
        "Genre: {genre}\nEra: {era}\nTechnology level: {tech}\nLocations: {locations}\nRules: {rules}\nThemes: {themes}",
        genre = non_empty(&world.genre),
        era = non_empty(&world.era),
        tech = non_empty(&world.technology_level),
        locations = join_or_none(&world.locations),
        rules = join_or_none(&world.rules),
        themes = join_or_none(&settings.themes),
    )
}

fn build_character_block(expected_characters: &[&CharacterProfile]) -> String {
    if expected_characters.is_empty() {
        return "(no characters named for this chapter — infer minimally from world/memory context)".to_string();
    }
    expected_characters
        .iter()
        .map(|c| {
            let relationships = if c.relationships.is_empty() {
                "none recorded".to_string()
            } else {
                c.relationships.iter().map(|(name, rel)| format!("{name} ({rel})")).collect::<Vec<_>>().join(", ")
            };
            format!(
                "- {name} [{role:?}]: traits={traits}; relationships: {relationships}",
                name = c.name,
                role = c.role,
                traits = join_or_none(&c.traits),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_memory_block(memory_context: &str) -> String {
    if memory_context.is_empty() {
        "(no retrieved memory for this chapter)".to_string()
    } else {
        memory_context.to_string()
    }
}

fn build_task_block(inputs: &GenerationInputs<'_>) -> String {
    let target = inputs.target_length.map(|n| format!("~{n} words")).unwrap_or_else(|| "no specific length target".to_string());
    let constraints = inputs.constraints.unwrap_or("none");
    let directive = match inputs.mode {
        GenerationMode::Full => format!("Write chapter {} in full, from the established outline.", inputs.chapter_number),
        GenerationMode::Continue => format!("Continue directly from the end of the previous chapter into chapter {}.", inputs.chapter_number),
        GenerationMode::Expand => format!("Flesh out and expand the indicated passage of chapter {} without changing its events.", inputs.chapter_number),
        GenerationMode::Rewrite => format!("Rewrite chapter {} under the new constraint below; it replaces the current version.", inputs.chapter_number),
        GenerationMode::Outline => format!("Produce a chapter-by-chapter outline summary starting at chapter {}.", inputs.chapter_number),
    };
    format!("{directive}\nTarget length: {target}\nConstraints: {constraints}")
}

/// CONTINUE/REWRITE/EXPAND carry the last ≤800 tokens of `previous_content`
/// as a continuation seed; FULL/OUTLINE have none.
fn build_continuation_seed_block(inputs: &GenerationInputs<'_>) -> String {
    use GenerationMode::*;
    if !matches!(inputs.mode, Continue | Rewrite | Expand) {
        return String::new();
    }
    let Some(previous) = inputs.previous_content else { return String::new() };
    let seed = last_n_tokens(previous, 800);
    format!("\n\nCONTINUATION SEED (end of the preceding text):\n{seed}")
}

/// The last `max_tokens` whitespace-delimited tokens of `text`, used as a
/// heuristic token-window (the gateway's own `count_tokens` is the
/// authoritative measure used by the outer budget loop; this is the simple
/// windowing the prompt assembly itself needs and stays pure/sync).
fn last_n_tokens(text: &str, max_tokens: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(max_tokens);
    words[start..].join(" ")
}

fn non_empty(value: &str) -> &str {
    if value.is_empty() {
        "unspecified"
    } else {
        value
    }
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_memory::{CharacterRole, WorldSetting};

    #[test]
    fn full_mode_has_no_continuation_seed() {
        let settings = ExtractedSettingsBundle::default();
        let inputs = GenerationInputs {
            mode: GenerationMode::Full,
            settings: &settings,
            expected_characters: vec![],
            memory_context: "",
            target_length: Some(1500),
            constraints: None,
            previous_content: None,
            chapter_number: 1,
        };
        let prompt = build_generation_prompt(&inputs);
        assert!(!prompt.contains("CONTINUATION SEED"));
    }

    #[test]
    fn continue_mode_includes_continuation_seed_from_previous_content() {
        let settings = ExtractedSettingsBundle::default();
        let previous = "word ".repeat(1000);
        let inputs = GenerationInputs {
            mode: GenerationMode::Continue,
            settings: &settings,
            expected_characters: vec![],
            memory_context: "",
            target_length: None,
            constraints: None,
            previous_content: Some(&previous),
            chapter_number: 2,
        };
        let prompt = build_generation_prompt(&inputs);
        assert!(prompt.contains("CONTINUATION SEED"));
        let seed_tokens = prompt.split("CONTINUATION SEED").nth(1).unwrap().split_whitespace().count();
        assert!(seed_tokens <= 801);
    }

    #[test]
    fn world_block_reports_genre_and_locations() {
        let mut settings = ExtractedSettingsBundle::default();
        settings.world = WorldSetting { genre: "cyberpunk".to_string(), locations: vec!["Shanghai".to_string()], ..Default::default() };
        let inputs = GenerationInputs {
            mode: GenerationMode::Full,
            settings: &settings,
            expected_characters: vec![],
            memory_context: "",
            target_length: None,
            constraints: None,
            previous_content: None,
            chapter_number: 1,
        };
        let prompt = build_generation_prompt(&inputs);
        assert!(prompt.contains("cyberpunk"));
        assert!(prompt.contains("Shanghai"));
    }

    #[test]
    fn character_block_lists_expected_characters_with_role() {
        let settings = ExtractedSettingsBundle::default();
        let character = CharacterProfile::new("Lin Feng", CharacterRole::Protagonist);
        let inputs = GenerationInputs {
            mode: GenerationMode::Full,
            settings: &settings,
            expected_characters: vec![&character],
            memory_context: "",
            target_length: None,
            constraints: None,
            previous_content: None,
            chapter_number: 1,
        };
        let prompt = build_generation_prompt(&inputs);
        assert!(prompt.contains("Lin Feng"));
        assert!(prompt.contains("Protagonist"));
    }
}
