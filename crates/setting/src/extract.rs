//! Step 1 of the per-turn pipeline: literal-phrase candidate-fragment
//! extraction over four categories (character mentions, world signals, plot
//! signals, style signals), emitted directly as the closed `SettingEdit`
//! union step 2 applies.
//!
//! A char-index-safe case-insensitive scanner so prefix matching never
//! panics or mis-slices on a multi-byte character boundary.

use quill_memory::{CharacterRole, PlotKind, PlotPoint, SettingEdit, WorldField};

/// World-rule assertion extraction: the world rule checker (component E)
/// needs a positive or negative assertion string to compare a turn's claim
/// against — "magic exists", "there's no AI at all" — which this function
/// turns into an `AddWorldRule` edit. Negation phrasing is checked first
/// since it is the more specific pattern ("there's no X" also happens to
/// contain "no", which alone is too broad a trigger for everyday text).
const NEGATION_PREFIXES: &[&str] = &["there's no ", "there is no ", "there isn't ", "there are no "];

/// Case-insensitive substring search that returns a byte offset valid for
/// the *original* string, scanning char-by-char rather than lowercasing the
/// whole haystack (whose lowercase form can have a different byte length
/// than the original on some multi-byte characters).
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle_chars: Vec<char> = needle.chars().collect();
    let hay_chars: Vec<(usize, char)> = haystack.char_indices().collect();
    'outer: for start_idx in 0..hay_chars.len() {
        if start_idx + needle_chars.len() > hay_chars.len() {
            break;
        }
        for (j, &nc) in needle_chars.iter().enumerate() {
            let hc = hay_chars[start_idx + j].1;
            let mut h_lower = hc.to_lowercase();
            let mut n_lower = nc.to_lowercase();
            if h_lower.next() != n_lower.next() {
                continue 'outer;
            }
        }
        return Some(hay_chars[start_idx].0);
    }
    None
}

/// The phrase up to the first sentence-ending punctuation, comma, or
/// newline, trimmed.
fn extract_phrase(text: &str) -> String {
    let end = text.find(['.', '!', '?', '\n']).unwrap_or(text.len());
    text[..end].trim().to_string()
}

/// The first comma-delimited clause only (a proper name is rarely more
/// than a couple of words).
fn extract_name(text: &str) -> String {
    let end = text.find([',', '.', '!', '?', '\n']).unwrap_or(text.len());
    text[..end].trim().trim_end_matches(|c: char| !c.is_alphanumeric()).to_string()
}

const GENRE_WORDS: &[&str] = &[
    "cyberpunk", "fantasy", "science fiction", "sci-fi", "scifi", "mystery", "romance", "thriller",
    "horror", "historical fiction", "historical", "noir", "steampunk", "dystopian", "adventure",
];

const TONE_WORDS: &[&str] = &[
    "dark", "gritty", "whimsical", "serious", "hopeful", "tense", "melancholic", "humorous",
    "lighthearted", "bleak", "tragic", "comedic",
];

const PLOT_STAKES_WORDS: &[&str] = &[
    "hunting", "searching for", "chasing", "mission to", "threat of", "conflict with", "war against",
    "quest for", "hiding from", "seeking", "race against", "betrayal",
];

/// Character-mention extraction: proper-noun + role-cue heuristics.
/// `"protagonist Lin Feng"` / `"protagonist is Lin Feng"` /
/// `"protagonist named Lin Feng"` for PROTAGONIST; the antagonist
/// equivalents for ANTAGONIST. Any trailing comma clause (`", ex-detective
/// hunting a missing AI"`) becomes a background/trait fragment on the same
/// character.
fn extract_character_edits(text: &str) -> Vec<SettingEdit> {
    let mut edits = Vec::new();

    for (role, prefixes) in [
        (CharacterRole::Protagonist, &["protagonist is ", "protagonist named ", "protagonist "][..]),
        (CharacterRole::Antagonist, &["antagonist is ", "antagonist named ", "antagonist "][..]),
    ] {
        for prefix in prefixes {
            let Some(pos) = find_ci(text, prefix) else { continue };
            let rest = &text[pos + prefix.len()..];
            let name = extract_name(rest);
            if name.is_empty() || name.len() > 60 {
                continue;
            }
            edits.push(SettingEdit::UpsertCharacter {
                name: name.clone(),
                role: Some(role),
                background: None,
                ai_generated: false,
            });

            // A trailing comma clause after the name becomes background,
            // e.g. "Lin Feng, ex-detective hunting a missing AI".
            if let Some(comma) = rest.find(',') {
                let clause = extract_phrase(&rest[comma + 1..]);
                if !clause.is_empty() && clause.len() <= 200 {
                    edits.push(SettingEdit::UpsertCharacter {
                        name: name.clone(),
                        role: None,
                        background: Some(clause.clone()),
                        ai_generated: false,
                    });
                    for trait_candidate in clause.split(',').map(str::trim) {
                        if !trait_candidate.is_empty() && trait_candidate.len() <= 40 {
                            edits.push(SettingEdit::AddTrait { character: name.clone(), trait_name: trait_candidate.to_string() });
                        }
                    }
                }
            }
            break;
        }
    }

    edits
}

/// World-signal extraction: genre words, a 4-digit era, and a location —
/// either explicitly named after `"set in <City>"` or, failing that, the
/// first standalone capitalized proper noun in the turn that isn't already
/// claimed as a character name.
fn extract_world_edits(text: &str, known_character_names: &[String]) -> Vec<SettingEdit> {
    let mut edits = Vec::new();
    let lower = text.to_lowercase();

    if let Some(genre) = GENRE_WORDS.iter().find(|g| lower.contains(*g)) {
        edits.push(SettingEdit::UpsertWorldField { field: WorldField::Genre, value: genre.to_string() });
    }

    if let Some(year) = find_four_digit_year(text) {
        edits.push(SettingEdit::UpsertWorldField { field: WorldField::Era, value: year });
    }

    let explicit_location = ["set in ", "takes place in "].iter().find_map(|prefix| {
        let pos = find_ci(text, prefix)?;
        next_capitalized_word(&text[pos + prefix.len()..])
    });

    let location = explicit_location.or_else(|| first_unclaimed_proper_noun(text, known_character_names));
    if let Some(location) = location {
        edits.push(SettingEdit::AddLocation { location });
    }

    edits
}

/// The first capitalized word that is not the first word of the text, not
/// an all-uppercase acronym (e.g. "AI"), and not part of any already-known
/// character name.
fn first_unclaimed_proper_noun(text: &str, known_character_names: &[String]) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for (idx, word) in words.iter().enumerate() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if idx == 0 || cleaned.len() < 3 {
            continue;
        }
        if !cleaned.chars().next().is_some_and(|c| c.is_uppercase()) {
            continue;
        }
        if cleaned.chars().all(|c| c.is_uppercase()) {
            continue;
        }
        if GENRE_WORDS.iter().any(|g| g.eq_ignore_ascii_case(&cleaned)) {
            continue;
        }
        if known_character_names.iter().any(|name| name.split_whitespace().any(|part| part == cleaned)) {
            continue;
        }
        return Some(cleaned);
    }
    None
}

fn find_four_digit_year(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    for i in 0..chars.len() {
        if i + 4 <= chars.len() && chars[i..i + 4].iter().all(|c| c.is_ascii_digit()) {
            let boundary_before = i == 0 || !chars[i - 1].is_alphanumeric();
            let boundary_after = i + 4 == chars.len() || !chars[i + 4].is_alphanumeric();
            if boundary_before && boundary_after {
                return Some(chars[i..i + 4].iter().collect());
            }
        }
    }
    None
}

fn next_capitalized_word(text: &str) -> Option<String> {
    for word in text.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.chars().next().is_some_and(|c| c.is_uppercase()) && cleaned.len() > 1 {
            return Some(cleaned);
        }
        // Only look at the very next word after the preposition.
        break;
    }
    None
}

/// World-rule extraction: a negation phrase ("there's no magic at all") or
/// an existence phrase ("magic exists") becomes a positive-assertion world
/// rule the checker can later compare a contradicting later turn against.
/// Only one rule is extracted per turn — a turn is one claim, not a list.
fn extract_world_rule_edits(text: &str) -> Vec<SettingEdit> {
    for prefix in NEGATION_PREFIXES {
        let Some(pos) = find_ci(text, prefix) else { continue };
        let clause = extract_phrase(&text[pos..]);
        if !clause.is_empty() && clause.len() <= 200 {
            return vec![SettingEdit::AddWorldRule { rule: clause }];
        }
    }

    if let Some(pos) = find_ci(text, " exists") {
        let before = &text[..pos];
        let start = before.rfind([',', '.', '!', '?', '\n']).map(|i| i + 1).unwrap_or(0);
        let clause = format!("{} exists", before[start..].trim()).trim().to_string();
        if clause != "exists" {
            return vec![SettingEdit::AddWorldRule { rule: clause }];
        }
    }

    Vec::new()
}

/// Plot-signal extraction: an action-verb + stakes-word phrase becomes a
/// SETUP plot point with the surrounding sentence as its summary.
fn extract_plot_edits(text: &str) -> Vec<SettingEdit> {
    let lower = text.to_lowercase();
    for stake_word in PLOT_STAKES_WORDS {
        if lower.contains(stake_word) {
            let summary = extract_phrase(text);
            if summary.is_empty() {
                continue;
            }
            return vec![SettingEdit::AddPlotPoint {
                point: PlotPoint {
                    chapter_hint: None,
                    summary,
                    kind: PlotKind::Setup,
                    involved_characters: Vec::new(),
                    resolved: false,
                },
            }];
        }
    }
    Vec::new()
}

/// Style-signal extraction: a tone word sets the `tone` STYLE aspect.
fn extract_style_edits(text: &str) -> Vec<SettingEdit> {
    let lower = text.to_lowercase();
    TONE_WORDS
        .iter()
        .find(|tone| lower.contains(*tone))
        .map(|tone| vec![SettingEdit::SetStyle { aspect: "tone".to_string(), value: tone.to_string() }])
        .unwrap_or_default()
}

/// Extracts all candidate edits for one turn of user text, across all four
/// fragment categories. Order is character, world, plot, style — the order
/// the bundle's step-2 merge is documented to expect is irrelevant since
/// each `SettingEdit` variant only touches its own slice of the bundle.
pub fn extract_candidate_edits(text: &str) -> Vec<SettingEdit> {
    let character_edits = extract_character_edits(text);
    let known_character_names: Vec<String> = character_edits
        .iter()
        .filter_map(|edit| match edit {
            SettingEdit::UpsertCharacter { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();

    let mut edits = character_edits;
    edits.extend(extract_world_edits(text, &known_character_names));
    edits.extend(extract_world_rule_edits(text));
    edits.extend(extract_plot_edits(text));
    edits.extend(extract_style_edits(text));
    edits
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_memory::ExtractedSettingsBundle;

    #[test]
    fn extracts_protagonist_name_role_and_background() {
        let edits = extract_candidate_edits("protagonist Lin Feng, ex-detective hunting a missing AI");
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.apply_edits(edits);
        let character = bundle.characters.iter().find(|c| c.name == "Lin Feng").unwrap();
        assert_eq!(character.role, CharacterRole::Protagonist);
        assert!(character.background.contains("ex-detective"));
    }

    #[test]
    fn extracts_genre_and_era() {
        let edits = extract_candidate_edits("I want a 2077 Shanghai cyberpunk novel");
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.apply_edits(edits);
        assert_eq!(bundle.world.genre, "cyberpunk");
        assert_eq!(bundle.world.era, "2077");
    }

    #[test]
    fn extraction_is_idempotent_under_double_application() {
        let text = "protagonist Lin Feng, ex-detective hunting a missing AI in a 2077 cyberpunk world";
        let mut once = ExtractedSettingsBundle::default();
        once.apply_edits(extract_candidate_edits(text));
        let mut twice = once.clone();
        twice.apply_edits(extract_candidate_edits(text));
        assert_eq!(once.characters.len(), twice.characters.len());
        assert_eq!(once.characters[0].traits.len(), twice.characters[0].traits.len());
    }

    #[test]
    fn extracts_plot_stakes_phrase() {
        let edits = extract_candidate_edits("Lin Feng is hunting a missing AI through the Shanghai undercity");
        assert!(edits.iter().any(|e| matches!(e, SettingEdit::AddPlotPoint { .. })));
    }

    #[test]
    fn extracts_negated_world_rule() {
        let edits = extract_candidate_edits("actually there's no AI at all in this world");
        let rule = edits.iter().find_map(|e| match e {
            SettingEdit::AddWorldRule { rule } => Some(rule.clone()),
            _ => None,
        });
        assert_eq!(rule, Some("there's no AI at all in this world".to_string()));
    }

    #[test]
    fn extracts_positive_world_rule_from_existence_phrase() {
        let edits = extract_candidate_edits("I want a fantasy novel where magic exists");
        let rule = edits.iter().find_map(|e| match e {
            SettingEdit::AddWorldRule { rule } => Some(rule.clone()),
            _ => None,
        });
        assert_eq!(rule, Some("I want a fantasy novel where magic exists".to_string()));
    }

    #[test]
    fn extracts_tone_style_hint() {
        let edits = extract_candidate_edits("keep the tone dark and gritty throughout");
        assert!(edits.iter().any(|e| matches!(e, SettingEdit::SetStyle { aspect, .. } if aspect == "tone")));
    }
}
