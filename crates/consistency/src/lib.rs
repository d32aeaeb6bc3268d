//! The consistency checker: three independent sub-checkers
//! (character/world/plot) emitting typed issues over two kinds of input — a
//! proposed settings change and a candidate chapter's generated text — plus
//! score aggregation.
//!
//! Generalized from a single binary accept/quarantine gate on one memory
//! tier into an ordered list of typed issues across three concerns. The
//! aggregation formula itself
//! (`score = 1 − errors·ERROR_WEIGHT − warns·WARN_WEIGHT − infos·INFO_WEIGHT`)
//! lives on `ConsistencyReport::from_issues` in `quill-memory`, which these
//! checkers feed.

use std::collections::HashMap;

use quill_memory::{CharacterRole, ConsistencyIssue, ConsistencyReport, ExtractedSettingsBundle, IssueSeverity};

/// Below this score a generation is blocked and the agent asks a
/// clarifying turn instead. Named here, not inlined, since the weights are
/// meant to be tunable.
pub const GENERATION_BLOCK_THRESHOLD: f32 = 0.5;

/// Checks a proposed settings change (the bundle before and after an
/// extractor merge) for character-tracker and world-rule issues. This is
/// the conflict check the setting pipeline's merge step delegates to.
pub fn check_settings_change(previous: &ExtractedSettingsBundle, candidate: &ExtractedSettingsBundle) -> ConsistencyReport {
    let mut issues = character_tracker(previous, candidate);
    issues.extend(world_rule_checker(previous, candidate));
    ConsistencyReport::from_issues(issues)
}

/// Checks a freshly generated chapter's text against the bundle it was
/// generated from: character name/role stability plus plot-point
/// resolution bookkeeping. `resolution` is an explicit flag the caller sets
/// (never inferred from the text).
pub fn check_chapter(bundle: &ExtractedSettingsBundle, chapter_text: &str, resolution: bool) -> ConsistencyReport {
    let mut issues = character_mentions_in_text(bundle, chapter_text);
    issues.extend(plot_consistency_checker(bundle, chapter_text, resolution));
    ConsistencyReport::from_issues(issues)
}

/// **Character tracker**: name spelling, role stability, and relationship
/// symmetry between the previous and candidate bundle.
fn character_tracker(previous: &ExtractedSettingsBundle, candidate: &ExtractedSettingsBundle) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let previous_by_name: HashMap<&str, &quill_memory::CharacterProfile> =
        previous.characters.iter().map(|c| (c.name.as_str(), c)).collect();

    for character in &candidate.characters {
        if let Some(prior) = previous_by_name.get(character.name.as_str()) {
            if prior.role != character.role && !role_change_is_benign(prior.role, character.role) {
                issues.push(ConsistencyIssue {
                    kind: "role-contradiction".to_string(),
                    severity: IssueSeverity::Error,
                    locus: character.name.clone(),
                    description: format!(
                        "{} changed role from {:?} to {:?} without an explicit rename",
                        character.name, prior.role, character.role
                    ),
                });
            }
        }

        for (other_name, relation) in &character.relationships {
            let Some(other) = candidate.characters.iter().find(|c| &c.name == other_name) else {
                issues.push(ConsistencyIssue {
                    kind: "unknown-name".to_string(),
                    severity: IssueSeverity::Warn,
                    locus: other_name.clone(),
                    description: format!("{} claims a relationship with unknown character {}", character.name, other_name),
                });
                continue;
            };
            if !other.relationships.contains_key(&character.name) {
                issues.push(ConsistencyIssue {
                    kind: "trait-reversal-without-reason".to_string(),
                    severity: IssueSeverity::Warn,
                    locus: format!("{}<->{}", character.name, other_name),
                    description: format!(
                        "{} claims relation '{}' to {} but the reverse is not recorded",
                        character.name, relation, other_name
                    ),
                });
            }
        }
    }
    issues
}

/// A minor→supporting→protagonist escalation (and its reverse on demotion)
/// is an ordinary part of authoring a story and is not itself a
/// contradiction; only a lateral swap (protagonist↔antagonist, say) is.
fn role_change_is_benign(previous: CharacterRole, next: CharacterRole) -> bool {
    use CharacterRole::*;
    matches!(
        (previous, next),
        (Minor, Supporting) | (Supporting, Minor) | (Minor, Protagonist) | (Supporting, Protagonist)
    )
}

/// Checks character mentions inside generated chapter text: flags a name
/// that resembles but does not exactly match a known character (likely a
/// misspelling).
fn character_mentions_in_text(bundle: &ExtractedSettingsBundle, chapter_text: &str) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let words: Vec<&str> = chapter_text.split_whitespace().collect();
    let known_names: Vec<&str> = bundle.characters.iter().map(|c| c.name.as_str()).collect();

    for word in &words {
        let cleaned = word.trim_matches(|c: char| !c.is_alphanumeric());
        if cleaned.len() < 3 || !cleaned.chars().next().is_some_and(|c| c.is_uppercase()) {
            continue;
        }
        if known_names.contains(&cleaned) {
            continue;
        }
        if let Some(close) = known_names.iter().find(|n| is_near_miss(n, cleaned)) {
            issues.push(ConsistencyIssue {
                kind: "unknown-name".to_string(),
                severity: IssueSeverity::Warn,
                locus: cleaned.to_string(),
                description: format!("'{cleaned}' resembles known character '{close}' but does not match exactly"),
            });
        }
    }
    issues
}

/// A cheap near-miss heuristic: same length and all but one character
/// equal, or one is a prefix of the other differing by a single
/// trailing/leading character. Good enough to catch typos without pulling
/// in a full edit-distance dependency for one heuristic check.
fn is_near_miss(known: &str, candidate: &str) -> bool {
    if known == candidate || known.len().abs_diff(candidate.len()) > 1 {
        return false;
    }
    let mismatches = known.chars().zip(candidate.chars()).filter(|(a, b)| a != b).count();
    mismatches <= 1 && known.len() == candidate.len()
}

/// World assertions recognized as direct negations of each other. Each pair
/// is compared case-insensitively as substrings of the genre/era/rules
/// fields and the plot summaries; an ambiguous case (neither side matches
/// this matrix) would be escalated to the LLM gateway in a full
/// implementation, but the matrix alone covers the literal contradiction of
/// a later "no AI at all" turn against an earlier "missing AI" plot point.
const NEGATION_PAIRS: &[(&str, &str)] = &[
    ("no ai", "ai"),
    ("no magic", "magic"),
    ("magic does not exist", "magic exists"),
];

/// **World rule checker**: compares new assertions (era/genre/rules/plot
/// text in `candidate`) against `previous` for negation via the light
/// contradiction matrix above.
fn world_rule_checker(previous: &ExtractedSettingsBundle, candidate: &ExtractedSettingsBundle) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let previous_assertions = collect_world_assertions(previous);
    let candidate_assertions = collect_world_assertions(candidate);

    for new_assertion in &candidate_assertions {
        for (negative, positive) in NEGATION_PAIRS {
            let new_is_negative = new_assertion.contains(negative);
            let new_is_positive = !new_is_negative && new_assertion.contains(positive);
            if !new_is_negative && !new_is_positive {
                continue;
            }
            for prior in &previous_assertions {
                let prior_is_negative = prior.contains(negative);
                let prior_is_positive = !prior_is_negative && prior.contains(positive);
                if (new_is_negative && prior_is_positive) || (new_is_positive && prior_is_negative) {
                    issues.push(ConsistencyIssue {
                        kind: "world-rule-contradiction".to_string(),
                        severity: IssueSeverity::Error,
                        locus: "world".to_string(),
                        description: format!("new assertion '{new_assertion}' contradicts prior assertion '{prior}'"),
                    });
                }
            }
        }
    }
    issues
}

fn collect_world_assertions(bundle: &ExtractedSettingsBundle) -> Vec<String> {
    let mut assertions = vec![bundle.world.genre.to_lowercase(), bundle.world.era.to_lowercase()];
    assertions.extend(bundle.world.rules.iter().map(|r| r.to_lowercase()));
    assertions.extend(bundle.plot_points.iter().map(|p| p.summary.to_lowercase()));
    assertions.retain(|a| !a.is_empty());
    assertions
}

/// **Plot consistency checker**: a plot point referenced in `chapter_text`
/// (its summary appears in the text) must only involve characters that
/// exist in the bundle's character memory — an involved character absent
/// from that memory is flagged WARN. Separately, a foreshadowed plot point
/// that never resolves is flagged — INFO while the story is ongoing, WARN
/// when `resolution` marks this as the resolution chapter — the signal
/// comes from this explicit flag, never inferred.
fn plot_consistency_checker(bundle: &ExtractedSettingsBundle, chapter_text: &str, resolution: bool) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let lower_text = chapter_text.to_lowercase();

    for point in &bundle.plot_points {
        let referenced = !lower_text.is_empty() && lower_text.contains(&point.summary.to_lowercase());
        if referenced {
            for character in &point.involved_characters {
                if !bundle.characters.iter().any(|c| c.name.eq_ignore_ascii_case(character)) {
                    issues.push(ConsistencyIssue {
                        kind: "unknown-referenced-character".to_string(),
                        severity: IssueSeverity::Warn,
                        locus: point.summary.clone(),
                        description: format!(
                            "plot point '{}' involves '{}', who is not tracked in character memory",
                            point.summary, character
                        ),
                    });
                }
            }
        }
        if !point.resolved {
            issues.push(ConsistencyIssue {
                kind: "unresolved-foreshadowing".to_string(),
                severity: if resolution { IssueSeverity::Warn } else { IssueSeverity::Info },
                locus: point.summary.clone(),
                description: if resolution {
                    format!("plot point '{}' remains unresolved in the marked resolution chapter", point.summary)
                } else {
                    format!("plot point '{}' is still open; story is ongoing", point.summary)
                },
            });
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_memory::{CharacterProfile, PlotKind, PlotPoint, WorldSetting};

    fn bundle_with_character(name: &str, role: CharacterRole) -> ExtractedSettingsBundle {
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.characters.push(CharacterProfile::new(name, role));
        bundle
    }

    #[test]
    fn role_contradiction_is_an_error() {
        let previous = bundle_with_character("Lin Feng", CharacterRole::Protagonist);
        let candidate = bundle_with_character("Lin Feng", CharacterRole::Antagonist);
        let report = check_settings_change(&previous, &candidate);
        assert!(report.has_errors());
    }

    #[test]
    fn promotion_from_minor_to_protagonist_is_not_an_error() {
        let previous = bundle_with_character("Ada", CharacterRole::Minor);
        let candidate = bundle_with_character("Ada", CharacterRole::Protagonist);
        let report = check_settings_change(&previous, &candidate);
        assert!(!report.has_errors());
    }

    #[test]
    fn asymmetric_relationship_is_a_warning() {
        let mut previous = ExtractedSettingsBundle::default();
        previous.characters.push(CharacterProfile::new("A", CharacterRole::Protagonist));
        previous.characters.push(CharacterProfile::new("B", CharacterRole::Supporting));
        let mut candidate = previous.clone();
        candidate.characters[0].relationships.insert("B".to_string(), "friend".to_string());
        let report = check_settings_change(&previous, &candidate);
        assert!(!report.has_errors());
        assert!(report.issues.iter().any(|i| i.kind == "trait-reversal-without-reason"));
    }

    #[test]
    fn contradicting_world_assertion_is_an_error() {
        let mut previous = ExtractedSettingsBundle::default();
        previous.plot_points.push(PlotPoint {
            chapter_hint: None,
            summary: "the missing AI holds the city's only working magic".to_string(),
            kind: PlotKind::Rising,
            involved_characters: vec![],
            resolved: false,
        });
        let mut candidate = previous.clone();
        candidate.world = WorldSetting { rules: vec!["there is no magic at all".to_string()], ..Default::default() };
        let report = check_settings_change(&previous, &candidate);
        assert!(report.has_errors());
    }

    #[test]
    fn unresolved_plot_point_is_info_when_story_ongoing_and_warn_at_resolution() {
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.plot_points.push(PlotPoint {
            chapter_hint: Some(1),
            summary: "a hidden letter".to_string(),
            kind: PlotKind::Setup,
            involved_characters: vec![],
            resolved: false,
        });
        let ongoing = check_chapter(&bundle, "some prose", false);
        let at_resolution = check_chapter(&bundle, "some prose", true);
        assert!(ongoing.issues.iter().any(|i| i.severity == IssueSeverity::Info));
        assert!(at_resolution.issues.iter().any(|i| i.severity == IssueSeverity::Warn));
    }

    #[test]
    fn plot_point_referencing_an_untracked_character_is_a_warning() {
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.characters.push(CharacterProfile::new("Lin Feng", CharacterRole::Protagonist));
        bundle.plot_points.push(PlotPoint {
            chapter_hint: Some(1),
            summary: "a hidden letter".to_string(),
            kind: PlotKind::Setup,
            involved_characters: vec!["Lin Feng".to_string(), "Ghost Courier".to_string()],
            resolved: true,
        });
        let report = check_chapter(&bundle, "the hidden letter surfaces again", false);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == "unknown-referenced-character" && i.description.contains("Ghost Courier")));
        assert!(!report.issues.iter().any(|i| i.description.contains("Lin Feng") && i.kind == "unknown-referenced-character"));
    }

    #[test]
    fn plot_point_not_referenced_in_text_is_not_checked_for_characters() {
        let mut bundle = ExtractedSettingsBundle::default();
        bundle.plot_points.push(PlotPoint {
            chapter_hint: Some(1),
            summary: "a hidden letter".to_string(),
            kind: PlotKind::Setup,
            involved_characters: vec!["Ghost Courier".to_string()],
            resolved: true,
        });
        let report = check_chapter(&bundle, "an unrelated scene about the docks", false);
        assert!(!report.issues.iter().any(|i| i.kind == "unknown-referenced-character"));
    }

    #[test]
    fn score_is_clamped_and_blocks_generation_below_threshold() {
        let mut previous = ExtractedSettingsBundle::default();
        previous.characters.push(CharacterProfile::new("X", CharacterRole::Protagonist));
        let mut candidate = previous.clone();
        candidate.characters[0].role = CharacterRole::Antagonist;
        let report = check_settings_change(&previous, &candidate);
        assert!(report.score >= 0.0 && report.score <= 1.0);
        assert!(report.score < GENERATION_BLOCK_THRESHOLD || report.has_errors());
    }
}
