//! The shared data model: the five-tier memory item, the character/world/
//! plot building blocks of a project's settings bundle, generation records,
//! sessions, and consistency reports. Characters and plot points reference
//! each other by name (a string key), never by pointer, so this model is a
//! plain tree+index structure with no cycle to worry about serializing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five retention buckets a memory item can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Global,
    Character,
    Plot,
    Context,
    Style,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 5] =
        [MemoryTier::Global, MemoryTier::Character, MemoryTier::Plot, MemoryTier::Context, MemoryTier::Style];
}

/// A single stored fact. `metadata` carries tier-specific structure (a
/// CONTEXT item's `order`, a STYLE item's `aspect`) without forcing every
/// tier into the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    pub level: MemoryTier,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub embedding: Option<Vec<f32>>,
    /// sha256 of `content` at the time `embedding` was last computed, used to
    /// detect drift: an item's embedding must be recomputed when content
    /// changes.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    pub fn new(level: MemoryTier, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash(&content),
            level,
            content,
            metadata: HashMap::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// A CONTEXT item's turn-index ordinal.
    pub fn order(&self) -> Option<i64> {
        self.metadata.get("order").and_then(|v| v.parse().ok())
    }

    /// A STYLE item's aspect key (tone, pacing, POV, ...); STYLE items are
    /// singletons per aspect.
    pub fn aspect(&self) -> Option<&str> {
        self.metadata.get("aspect").map(|s| s.as_str())
    }
}

pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Protagonist,
    Antagonist,
    Supporting,
    Minor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub role: CharacterRole,
    pub traits: Vec<String>,
    pub background: String,
    /// name -> relation-string, e.g. "Lin Feng" -> "mentor"
    pub relationships: HashMap<String, String>,
    pub ai_generated: bool,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>, role: CharacterRole) -> Self {
        Self {
            name: name.into(),
            role,
            traits: Vec::new(),
            background: String::new(),
            relationships: HashMap::new(),
            ai_generated: false,
        }
    }

    fn add_trait(&mut self, new_trait: String) {
        if !self.traits.iter().any(|t| t.eq_ignore_ascii_case(&new_trait)) {
            self.traits.push(new_trait);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSetting {
    pub genre: String,
    pub era: String,
    pub locations: Vec<String>,
    pub rules: Vec<String>,
    pub technology_level: String,
    pub ai_generated: bool,
}

impl WorldSetting {
    fn add_location(&mut self, location: String) {
        if !self.locations.iter().any(|l| l.eq_ignore_ascii_case(&location)) {
            self.locations.push(location);
        }
    }

    fn add_rule(&mut self, rule: String) {
        if !self.rules.iter().any(|r| r.eq_ignore_ascii_case(&rule)) {
            self.rules.push(rule);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotKind {
    Setup,
    Inciting,
    Rising,
    Climax,
    Resolution,
    Subplot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotPoint {
    pub chapter_hint: Option<u32>,
    pub summary: String,
    pub kind: PlotKind,
    pub involved_characters: Vec<String>,
    pub resolved: bool,
}

/// The authoritative, project-level state that all generation reads from a
/// snapshot of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedSettingsBundle {
    pub characters: Vec<CharacterProfile>,
    pub world: WorldSetting,
    pub plot_points: Vec<PlotPoint>,
    pub themes: Vec<String>,
    pub style_hints: HashMap<String, String>,
}

/// The closed union of setting edit operations the extractor emits and the
/// bundle applies deterministically. Replaces duck-typed patch objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SettingEdit {
    UpsertCharacter { name: String, role: Option<CharacterRole>, background: Option<String>, ai_generated: bool },
    AddTrait { character: String, trait_name: String },
    AddRelationship { character: String, other: String, relation: String },
    AddLocation { location: String },
    AddWorldRule { rule: String },
    UpsertWorldField { field: WorldField, value: String },
    AddPlotPoint { point: PlotPoint },
    SetStyle { aspect: String, value: String },
    AddTheme { theme: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldField {
    Genre,
    Era,
    TechnologyLevel,
}

impl ExtractedSettingsBundle {
    /// Applies one edit. Character/location/rule merges are additive unions;
    /// `UpsertCharacter` is a name-keyed union; plot points are append-only.
    pub fn apply_edit(&mut self, edit: SettingEdit) {
        match edit {
            SettingEdit::UpsertCharacter { name, role, background, ai_generated } => {
                if let Some(existing) = self.characters.iter_mut().find(|c| c.name == name) {
                    if let Some(role) = role {
                        existing.role = role;
                    }
                    if let Some(background) = background {
                        existing.background = background;
                    }
                    existing.ai_generated = existing.ai_generated || ai_generated;
                } else {
                    let mut profile = CharacterProfile::new(name, role.unwrap_or(CharacterRole::Minor));
                    profile.background = background.unwrap_or_default();
                    profile.ai_generated = ai_generated;
                    self.characters.push(profile);
                }
            }
            SettingEdit::AddTrait { character, trait_name } => {
                if let Some(profile) = self.characters.iter_mut().find(|c| c.name == character) {
                    profile.add_trait(trait_name);
                }
            }
            SettingEdit::AddRelationship { character, other, relation } => {
                if let Some(profile) = self.characters.iter_mut().find(|c| c.name == character) {
                    profile.relationships.insert(other, relation);
                }
            }
            SettingEdit::AddLocation { location } => self.world.add_location(location),
            SettingEdit::AddWorldRule { rule } => self.world.add_rule(rule),
            SettingEdit::UpsertWorldField { field, value } => match field {
                WorldField::Genre => self.world.genre = value,
                WorldField::Era => self.world.era = value,
                WorldField::TechnologyLevel => self.world.technology_level = value,
            },
            SettingEdit::AddPlotPoint { point } => self.plot_points.push(point),
            SettingEdit::SetStyle { aspect, value } => {
                self.style_hints.insert(aspect, value);
            }
            SettingEdit::AddTheme { theme } => {
                if !self.themes.iter().any(|t| t.eq_ignore_ascii_case(&theme)) {
                    self.themes.push(theme);
                }
            }
        }
    }

    pub fn apply_edits(&mut self, edits: impl IntoIterator<Item = SettingEdit>) {
        for edit in edits {
            self.apply_edit(edit);
        }
    }

    /// Stable hash over the canonicalized (key-sorted) bundle, used to
    /// detect whether generation premises changed since a record was
    /// produced. Stable under key reordering.
    pub fn fingerprint(&self) -> String {
        let mut characters = self.characters.clone();
        characters.sort_by(|a, b| a.name.cmp(&b.name));
        for character in &mut characters {
            character.traits.sort();
            let mut rel: Vec<_> = character.relationships.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            rel.sort();
            character.relationships = rel.into_iter().collect();
        }
        let mut world = self.world.clone();
        world.locations.sort();
        world.rules.sort();
        let mut themes = self.themes.clone();
        themes.sort();
        let mut style: Vec<_> = self.style_hints.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        style.sort();

        let canonical = serde_json::json!({
            "characters": characters,
            "world": world,
            "plot_points": self.plot_points,
            "themes": themes,
            "style_hints": style,
        });
        content_hash(&canonical.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Full,
    Continue,
    Expand,
    Rewrite,
    Outline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    Pending,
    Generating,
    Draft,
    Current,
    History,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub project_id: String,
    pub chapter_number: u32,
    pub mode: GenerationMode,
    pub content: String,
    pub word_count: usize,
    pub parent_id: Option<Uuid>,
    pub state: ChapterState,
    pub created_at: DateTime<Utc>,
    pub settings_fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub project_id: Option<String>,
    pub turns: Vec<Turn>,
    pub derived_settings: ExtractedSettingsBundle,
}

impl Session {
    pub fn new(session_id: impl Into<String>, project_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project_id,
            turns: Vec::new(),
            derived_settings: ExtractedSettingsBundle::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub kind: String,
    pub severity: IssueSeverity,
    pub locus: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub score: f32,
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    /// `score = 1 − (errors·0.3 + warns·0.1 + infos·0.02)`, clamped to
    /// `[0,1]`. Weights are chosen, not derived; kept as named
    /// constants so a future tuning pass is a one-line change.
    pub const ERROR_WEIGHT: f32 = 0.3;
    pub const WARN_WEIGHT: f32 = 0.1;
    pub const INFO_WEIGHT: f32 = 0.02;

    pub fn from_issues(issues: Vec<ConsistencyIssue>) -> Self {
        let mut penalty = 0.0;
        for issue in &issues {
            penalty += match issue.severity {
                IssueSeverity::Error => Self::ERROR_WEIGHT,
                IssueSeverity::Warn => Self::WARN_WEIGHT,
                IssueSeverity::Info => Self::INFO_WEIGHT,
            };
        }
        let mut issues = issues;
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        Self { score: (1.0 - penalty).clamp(0.0, 1.0), issues }
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }
}
