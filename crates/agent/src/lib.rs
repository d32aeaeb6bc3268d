//! The conversational agent: the per-turn coordinator that wires intent
//! recognition -> setting extraction -> creation decision -> generation,
//! persists any produced artifacts back into memory, and exposes the Agent
//! API (`chat`, `chat_stream`, `generate_chapter`, `list_generations`).
//!
//! Grounded on `runtime/src/runtime/chat.rs`'s `respond_and_remember_stream`
//! per-turn shape (persist -> extract -> retrieve -> assemble -> call LLM
//! -> persist reply), generalized into a classify -> extract -> decide ->
//! generate -> commit algorithm.

pub mod context;
pub mod decision;
pub mod error;

pub use context::AgentContext;
pub use error::{CoreError, ErrorKind};

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use quill_generator::{generate as run_generation, GenerationOutput, GenerationRequest};
use quill_intent::{recognize, Intent};
use quill_llm::CancellationToken;
use quill_memory::{
    ChapterState, ConsistencyReport, ExtractedSettingsBundle, GenerationMode, GenerationRecord, MemoryItem, MemoryTier,
    Turn, TurnRole,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-turn default wall-clock budget; exceeding it is a `TIMEOUT`, and the
/// turn is recorded as failed with session state left exactly as it was
/// before the turn started (no partial commit happens before this point —
/// the commit is the pipeline's last step).
const TURN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// CONTEXT tier ring-buffer bound: the most recent 2-3 chapters verbatim
/// plus recent dialogue. This engine keeps the most recent
/// `CONTEXT_RING_BOUND` items per project and evicts the oldest once
/// that's exceeded, the same ring-buffer shape `SessionRepository`'s
/// `evict` already uses for the turn window.
const CONTEXT_RING_BOUND: usize = 40;

// ---------------------------------------------------------------------
// Agent API request/response shapes
// ---------------------------------------------------------------------

pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedChapterSummary {
    pub chapter_number: u32,
    pub content: String,
    pub word_count: usize,
}

#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl From<&CoreError> for ErrorEnvelope {
    fn from(err: &CoreError) -> Self {
        Self { kind: err.kind, retryable: err.retryable() }
    }
}

/// `chat(...) -> {session_id, reply_text, generated?, consistency?}`. On an
/// unrecoverable failure the agent still returns a reply — never an `Err`
/// to its own caller — carrying a neutral `reply_text` and `error` instead,
/// so the agent always returns a reply payload.
pub struct ChatReply {
    pub session_id: String,
    pub reply_text: String,
    pub generated: Option<GeneratedChapterSummary>,
    pub consistency: Option<ConsistencyReport>,
    pub error: Option<ErrorEnvelope>,
}

impl ChatReply {
    fn failure(session_id: String, err: CoreError) -> Self {
        tracing::warn!(kind = ?err.kind, message = %err.message, "turn failed, returning neutral reply");
        Self {
            session_id,
            reply_text: "something went wrong; please try again".to_string(),
            generated: None,
            consistency: None,
            error: Some(ErrorEnvelope::from(&err)),
        }
    }
}

/// `chat_stream`'s lazy sequence of events.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Token(String),
    Artifact(GeneratedChapterSummary),
    Consistency(ConsistencyReport),
    Done,
    Error(ErrorEnvelope),
}

pub struct GenerateChapterOutcome {
    pub record: GenerationRecord,
    /// Set when this caller attached to an already-in-flight generation
    /// for the same `(project_id, chapter_number)` instead of starting a
    /// new one — the second of two concurrent callers observes
    /// `coalesced=true`.
    pub coalesced: bool,
}

// ---------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------

/// Runs one user turn to completion. Never propagates an error to its
/// caller: an unrecoverable failure is folded into the returned
/// `ChatReply`.
pub async fn chat(context: &Arc<AgentContext>, request: ChatRequest) -> ChatReply {
    let session_id = request.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    // Per-session serialization: a new turn waits for the prior turn's
    // full pipeline (through the end-of-turn commit) to finish.
    let lock = context.session_lock(&session_id);
    let _guard = lock.lock().await;

    let turn_future = run_turn(context, session_id.clone(), request.message.clone(), request.project_id.clone());
    match tokio::time::timeout(TURN_TIMEOUT, turn_future).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => ChatReply::failure(session_id, err),
        Err(_elapsed) => ChatReply::failure(session_id, CoreError::new(ErrorKind::Timeout, "turn exceeded wall-clock budget")),
    }
}

/// A thin streaming adapter over `chat`: the assembled reply is chunked
/// into word-sized `Token` events followed by `Artifact`/`Consistency`/
/// `Done`. True incremental provider streaming lives at `quill_llm::
/// LlmGateway::generate_stream`; wiring it end-to-end through generation
/// would duplicate `quill_generator::generate`'s prompt-assembly pipeline
/// for no behavior beyond what the gateway-level streaming tests already
/// cover.
///
/// The turn is raced against `cancel`, not merely checked after the fact: a
/// cancellation during the turn — including while its LLM call is in
/// flight — drops the `chat` future outright, which tears down whatever
/// request the provider had open, rather than letting it run to completion
/// and discarding the result.
pub async fn chat_stream(context: Arc<AgentContext>, request: ChatRequest, cancel: CancellationToken) -> mpsc::Receiver<ChatEvent> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            reply = chat(&context, request) => reply,
        };
        for word in reply.reply_text.split_inclusive(' ') {
            if cancel.is_cancelled() {
                return;
            }
            if tx.send(ChatEvent::Token(word.to_string())).await.is_err() {
                return;
            }
        }
        if let Some(generated) = reply.generated {
            let _ = tx.send(ChatEvent::Artifact(generated)).await;
        }
        if let Some(report) = reply.consistency {
            let _ = tx.send(ChatEvent::Consistency(report)).await;
        }
        match reply.error {
            Some(envelope) => {
                let _ = tx.send(ChatEvent::Error(envelope)).await;
            }
            None => {
                let _ = tx.send(ChatEvent::Done).await;
            }
        }
    });
    rx
}

async fn run_turn(
    context: &Arc<AgentContext>,
    session_id: String,
    message: String,
    project_id: Option<String>,
) -> Result<ChatReply, CoreError> {
    context.sessions.create(&session_id, project_id.clone()).await?;
    context.sessions.append_turn(&session_id, Turn { role: TurnRole::User, text: message.clone(), ts: Utc::now() }).await?;
    let session = context.sessions.load(&session_id).await?.ok_or_else(|| CoreError::not_found(session_id.clone()))?;

    // A session may but need not be bound to a project; when neither the
    // request nor the session names one, the session's
    // own id doubles as its project id, giving every session a stable,
    // empty-seeded project to accumulate settings into.
    let project_id = project_id.or(session.project_id.clone()).unwrap_or_else(|| session_id.clone());
    context.projects.create(&project_id).await?;
    let mut bundle = context.projects.get(&project_id).await?.unwrap_or_default();

    let intent = recognize(&context.gateway, &message).await?;

    let mut report: Option<ConsistencyReport> = None;
    let mut conflict_notes: Vec<String> = Vec::new();
    if matches!(intent.intent, Intent::CreateStory | Intent::ModifySetting | Intent::ModifyContent) {
        match quill_setting::process_turn(&context.gateway, &bundle, &message).await {
            Ok(outcome) => {
                bundle = outcome.bundle;
                report = Some(outcome.report);
                conflict_notes = outcome.conflict_notes;
            }
            Err(err) => {
                tracing::warn!(error = %err, "setting extraction failed for this turn, proceeding with the bundle unmodified");
            }
        }
    }

    // An ERROR conflict drafts a clarification and skips generation
    // outright, before the creation decision even runs.
    if let Some(active_report) = report.as_ref().filter(|r| r.has_errors()) {
        let reply_text = draft_clarification(active_report, &conflict_notes);
        context.projects.update(&project_id, bundle.clone()).await?;
        context.sessions.append_turn(&session_id, Turn { role: TurnRole::Assistant, text: reply_text.clone(), ts: Utc::now() }).await?;
        sync_context_turn(context, &project_id, &session, &message, &reply_text).await?;
        return Ok(ChatReply { session_id, reply_text, generated: None, consistency: report, error: None });
    }

    let completeness = quill_setting::assess_completeness(&bundle).score;
    let consistency_score = report.as_ref().map(|r| r.score).unwrap_or(1.0);
    let completion_threshold = context.config.thresholds.completion_threshold;
    let consistency_threshold = context.config.thresholds.consistency_threshold;
    let should_generate =
        decision::creation_decision(intent.intent, completeness, consistency_score, &message, completion_threshold, consistency_threshold);

    let mut generated = None;
    let mut reply_text;

    if should_generate {
        let current_chapter = context
            .chapters
            .list(&project_id)
            .await?
            .into_iter()
            .filter(|r| r.state == ChapterState::Current)
            .max_by_key(|r| r.chapter_number);
        let mode = decision::select_mode(&message, current_chapter.is_some());
        let resolution = matches!(mode, GenerationMode::Rewrite) && mode_targets_resolution(&bundle, &message);

        let chapter_number = match mode {
            GenerationMode::Continue => current_chapter.as_ref().map(|r| r.chapter_number + 1).unwrap_or(1),
            GenerationMode::Rewrite | GenerationMode::Expand => {
                decision::target_chapter_number(&message).unwrap_or_else(|| current_chapter.as_ref().map(|r| r.chapter_number).unwrap_or(1))
            }
            GenerationMode::Full | GenerationMode::Outline => {
                context.chapters.list(&project_id).await?.iter().map(|r| r.chapter_number).max().map(|n| n + 1).unwrap_or(1)
            }
        };

        // Generation reads settings back from `ProjectRepository` itself (it
        // may run inside a coalesced future another caller started), so this
        // turn's edits must be durable before the call, not merely held in
        // `bundle` here.
        context.projects.update(&project_id, bundle.clone()).await?;
        let outcome = run_generation_coalesced(context, &project_id, chapter_number, mode, None, resolution).await?;
        let record = outcome.record;
        sync_generation_artifacts(context, &project_id, &bundle, &record).await?;
        bundle = context.projects.get(&project_id).await?.unwrap_or(bundle);

        let plot_report = quill_consistency::check_chapter(&bundle, &record.content, resolution);
        generated = Some(GeneratedChapterSummary { chapter_number: record.chapter_number, content: record.content.clone(), word_count: record.word_count });
        reply_text = format!("Chapter {} is ready ({} words).", record.chapter_number, record.word_count);
        report = Some(plot_report);
    } else {
        reply_text = draft_conversational_reply(&intent, &bundle, completeness);
    }

    if !conflict_notes.is_empty() {
        reply_text.push_str("\n\n");
        reply_text.push_str(&conflict_notes.join(" "));
    }

    context.projects.update(&project_id, bundle.clone()).await?;
    context.sessions.append_turn(&session_id, Turn { role: TurnRole::Assistant, text: reply_text.clone(), ts: Utc::now() }).await?;
    sync_context_turn(context, &project_id, &session, &message, &reply_text).await?;
    evict_session_if_over_cap(context, &session_id).await?;

    Ok(ChatReply { session_id, reply_text, generated, consistency: report, error: None })
}

/// Plot-resolution signaling is an explicit flag at generation time; a
/// rewrite targeting the story's marked resolution chapter is the one
/// place a chat turn can set it, inferred only from the plot point the
/// author tagged `Resolution`, never from chapter text.
fn mode_targets_resolution(bundle: &ExtractedSettingsBundle, message: &str) -> bool {
    let Some(chapter) = decision::target_chapter_number(message) else { return false };
    bundle.plot_points.iter().any(|p| p.chapter_hint == Some(chapter) && p.kind == quill_memory::PlotKind::Resolution)
}

fn draft_clarification(report: &ConsistencyReport, conflict_notes: &[String]) -> String {
    let mut text = String::from("I noticed a contradiction before generating anything: ");
    let descriptions: Vec<&str> = report.issues.iter().filter(|i| i.severity == quill_memory::IssueSeverity::Error).map(|i| i.description.as_str()).collect();
    text.push_str(&descriptions.join("; "));
    text.push_str(". Could you clarify which version is correct?");
    if !conflict_notes.is_empty() {
        text.push('\n');
        text.push_str(&conflict_notes.join(" "));
    }
    text
}

fn draft_conversational_reply(intent: &quill_intent::IntentResult, bundle: &ExtractedSettingsBundle, completeness: f32) -> String {
    match intent.intent {
        Intent::CreateStory => format!(
            "Got it — noting down the setting so far (completeness {:.0}%). Say \"write chapter 1\" whenever you're ready to start.",
            completeness * 100.0
        ),
        Intent::Query => summarize_bundle(bundle),
        _ => "Noted — let me know when you'd like me to write or continue a chapter.".to_string(),
    }
}

fn summarize_bundle(bundle: &ExtractedSettingsBundle) -> String {
    let protagonist = bundle.characters.iter().find(|c| c.role == quill_memory::CharacterRole::Protagonist).map(|c| c.name.as_str()).unwrap_or("no protagonist yet");
    format!(
        "So far: genre={genre}, protagonist={protagonist}, locations={locations:?}, open plot points={plot}.",
        genre = if bundle.world.genre.is_empty() { "unset" } else { &bundle.world.genre },
        locations = bundle.world.locations,
        plot = bundle.plot_points.iter().filter(|p| !p.resolved).count(),
    )
}

// ---------------------------------------------------------------------
// Memory sync: mirrors relevant parts of the authoritative bundle into
// the five-tier MemoryRepository so `build_context`'s retrieval has
// something to search over. The bundle in ProjectRepository remains the
// single authoritative source; these items are a retrieval-oriented
// projection of it.
// ---------------------------------------------------------------------

async fn sync_context_turn(
    context: &Arc<AgentContext>,
    project_id: &str,
    session_before: &quill_memory::Session,
    user_text: &str,
    assistant_text: &str,
) -> Result<(), CoreError> {
    let order = session_before.turns.len() as i64;
    let item = MemoryItem::new(MemoryTier::Context, format!("user: {user_text}\nassistant: {assistant_text}"))
        .with_metadata("project_id", project_id)
        .with_metadata("order", order.to_string());
    context.memory.add(item).await?;

    let mut context_items = context.memory.list(MemoryTier::Context, None).await?;
    context_items.retain(|i| i.metadata.get("project_id").map(String::as_str) == Some(project_id));
    if context_items.len() > CONTEXT_RING_BOUND {
        context_items.sort_by_key(|i| i.order().unwrap_or(0));
        for stale in context_items.iter().take(context_items.len() - CONTEXT_RING_BOUND) {
            context.memory.delete(stale.id).await?;
        }
    }
    Ok(())
}

async fn sync_generation_artifacts(
    context: &Arc<AgentContext>,
    project_id: &str,
    bundle: &ExtractedSettingsBundle,
    record: &GenerationRecord,
) -> Result<(), CoreError> {
    sync_characters(context, project_id, bundle).await?;
    sync_world(context, project_id, bundle).await?;
    sync_style(context, project_id, bundle).await?;

    let plot_item = quill_generator::plot_summary_memory_item(project_id, record.chapter_number, &truncate_summary(&record.content));
    context.memory.add(plot_item).await?;
    Ok(())
}

fn truncate_summary(content: &str) -> String {
    content.split_whitespace().take(200).collect::<Vec<_>>().join(" ")
}

async fn sync_characters(context: &Arc<AgentContext>, project_id: &str, bundle: &ExtractedSettingsBundle) -> Result<(), CoreError> {
    let existing = context.memory.list(MemoryTier::Character, None).await?;
    for character in &bundle.characters {
        let content = format!(
            "{} ({:?}): traits=[{}]; background={}",
            character.name,
            character.role,
            character.traits.join(", "),
            character.background
        );
        let found = existing.iter().find(|i| {
            i.metadata.get("project_id").map(String::as_str) == Some(project_id)
                && i.metadata.get("character_name").map(String::as_str) == Some(character.name.as_str())
        });
        match found {
            Some(item) => {
                let id = item.id;
                context.memory.update(id, Box::new(move |item| item.content = content)).await?;
            }
            None => {
                let item = MemoryItem::new(MemoryTier::Character, content)
                    .with_metadata("project_id", project_id)
                    .with_metadata("character_name", character.name.clone());
                context.memory.add(item).await?;
            }
        }
    }
    Ok(())
}

async fn sync_world(context: &Arc<AgentContext>, project_id: &str, bundle: &ExtractedSettingsBundle) -> Result<(), CoreError> {
    let content = format!(
        "genre={}; era={}; locations={:?}; rules={:?}; technology_level={}",
        bundle.world.genre, bundle.world.era, bundle.world.locations, bundle.world.rules, bundle.world.technology_level
    );
    let existing = context.memory.list(MemoryTier::Global, None).await?;
    let found = existing.iter().find(|i| i.metadata.get("project_id").map(String::as_str) == Some(project_id) && i.metadata.get("aspect").map(String::as_str) == Some("world"));
    match found {
        Some(item) => {
            let id = item.id;
            context.memory.update(id, Box::new(move |item| item.content = content)).await?;
        }
        None => {
            let item = MemoryItem::new(MemoryTier::Global, content).with_metadata("project_id", project_id).with_metadata("aspect", "world");
            context.memory.add(item).await?;
        }
    }
    Ok(())
}

/// STYLE items are singletons per aspect; each `aspect` in `style_hints`
/// upserts its own item.
async fn sync_style(context: &Arc<AgentContext>, project_id: &str, bundle: &ExtractedSettingsBundle) -> Result<(), CoreError> {
    let existing = context.memory.list(MemoryTier::Style, None).await?;
    for (aspect, value) in &bundle.style_hints {
        let found = existing.iter().find(|i| i.metadata.get("project_id").map(String::as_str) == Some(project_id) && i.aspect() == Some(aspect.as_str()));
        match found {
            Some(item) => {
                let id = item.id;
                let value = value.clone();
                context.memory.update(id, Box::new(move |item| item.content = value)).await?;
            }
            None => {
                let item = MemoryItem::new(MemoryTier::Style, value.clone()).with_metadata("project_id", project_id).with_metadata("aspect", aspect.clone());
                context.memory.add(item).await?;
            }
        }
    }
    Ok(())
}

async fn evict_session_if_over_cap(context: &Arc<AgentContext>, session_id: &str) -> Result<(), CoreError> {
    let cap = context.config.memory.session_turn_cap;
    let evicted = context.sessions.evict(session_id, cap).await?;
    if evicted.is_empty() {
        return Ok(());
    }
    let summary = evicted.iter().map(|t| format!("{:?}: {}", t.role, t.text)).collect::<Vec<_>>().join("\n");
    let item = MemoryItem::new(MemoryTier::Context, summary).with_metadata("session_id", session_id).with_metadata("evicted", "true");
    context.memory.add(item).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// generate_chapter / list_generations (Agent API)
// ---------------------------------------------------------------------

pub async fn generate_chapter(
    context: &Arc<AgentContext>,
    project_id: &str,
    chapter_number: u32,
    mode: GenerationMode,
    constraints: Option<String>,
) -> Result<GenerateChapterOutcome, CoreError> {
    run_generation_coalesced(context, project_id, chapter_number, mode, constraints, false).await
}

pub async fn list_generations(context: &Arc<AgentContext>, project_id: &str) -> Result<Vec<GenerationRecord>, CoreError> {
    Ok(context.chapters.list(project_id).await?)
}

/// Per-`(project_id, chapter_number)` single-flight generation. The first
/// caller for a key builds and stores a `Shared` future; any caller that
/// arrives while it is still running attaches to that same future and
/// observes `coalesced=true` — coalescing is the default, guaranteeing
/// exactly one record per key even under concurrent callers.
async fn run_generation_coalesced(
    context: &Arc<AgentContext>,
    project_id: &str,
    chapter_number: u32,
    mode: GenerationMode,
    constraints: Option<String>,
    resolution: bool,
) -> Result<GenerateChapterOutcome, CoreError> {
    let key = (project_id.to_string(), chapter_number);
    let slot = context.generation_slot(key.clone());

    let (future, is_creator) = {
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(existing) => (existing.clone(), false),
            None => {
                let fut = build_generation_future(context.clone(), project_id.to_string(), chapter_number, mode, constraints, resolution);
                let shared = fut.shared();
                *guard = Some(shared.clone());
                (shared, true)
            }
        }
    };

    let result = future.await;

    if is_creator {
        context.clear_generation_slot(&key);
    }

    match &*result {
        Ok(record) => Ok(GenerateChapterOutcome { record: record.clone(), coalesced: !is_creator }),
        Err(err) => Err(err.clone()),
    }
}

fn build_generation_future(
    context: Arc<AgentContext>,
    project_id: String,
    chapter_number: u32,
    mode: GenerationMode,
    constraints: Option<String>,
    resolution: bool,
) -> BoxFuture<'static, Arc<Result<GenerationRecord, CoreError>>> {
    async move {
        let outcome = run_single_generation(&context, &project_id, chapter_number, mode, constraints, resolution).await;
        Arc::new(outcome)
    }
    .boxed()
}

async fn run_single_generation(
    context: &Arc<AgentContext>,
    project_id: &str,
    chapter_number: u32,
    mode: GenerationMode,
    constraints: Option<String>,
    resolution: bool,
) -> Result<GenerationRecord, CoreError> {
    let bundle = context.projects.get(project_id).await?.unwrap_or_default();
    let all_memory = context.memory.all().await?;
    let memory_items: Vec<MemoryItem> = all_memory.into_iter().filter(|i| i.metadata.get("project_id").map(String::as_str) == Some(project_id)).collect();

    let current = context.chapters.get_current(project_id, chapter_number).await?;
    let previous_content = match mode {
        GenerationMode::Continue => {
            let prior_number = chapter_number.saturating_sub(1);
            context.chapters.get_current(project_id, prior_number).await?.map(|r| r.content)
        }
        GenerationMode::Rewrite | GenerationMode::Expand => current.as_ref().map(|r| r.content.clone()),
        GenerationMode::Full | GenerationMode::Outline => None,
    };
    let parent_id = current.as_ref().map(|r| r.id);

    let request = GenerationRequest {
        project_id: project_id.to_string(),
        chapter_number,
        mode,
        settings: &bundle,
        memory_items: &memory_items,
        target_length: None,
        constraints,
        previous_content,
        parent_id,
        resolution,
        context_window: context.config.llm.context_window,
        generation_max_tokens: context.config.llm.generation_max_tokens,
    };

    let GenerationOutput { record, report: _, plot_summary } = run_generation(&context.gateway, request).await?;

    context.chapters.add(record.clone()).await?;
    if !matches!(mode, GenerationMode::Outline) {
        context.chapters.set_current(project_id, chapter_number, record.id).await?;
    }
    let plot_item = quill_generator::plot_summary_memory_item(project_id, chapter_number, &plot_summary);
    context.memory.add(plot_item).await?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_config::AppConfig;
    use quill_llm::{LlmGateway, MockProvider};
    use quill_memory::{InMemoryChapterRepository, InMemoryMemoryRepository, InMemoryProjectRepository, InMemorySessionRepository, InMemoryVectorStore};

    fn build_context() -> Arc<AgentContext> {
        Arc::new(AgentContext::new(
            Arc::new(InMemoryMemoryRepository::default()),
            Arc::new(InMemoryProjectRepository::default()),
            Arc::new(InMemoryChapterRepository::default()),
            Arc::new(InMemorySessionRepository::default()),
            Arc::new(InMemoryVectorStore::default()),
            Arc::new(LlmGateway::new(Box::new(MockProvider::echo()))),
            AppConfig::default(),
        ))
    }

    #[tokio::test]
    async fn cold_start_extracts_settings_without_generating() {
        let context = build_context();
        let reply = chat(
            &context,
            ChatRequest {
                session_id: Some("s1".to_string()),
                message: "I want a 2077 Shanghai cyberpunk novel, protagonist Lin Feng, ex-detective hunting a missing AI".to_string(),
                project_id: None,
            },
        )
        .await;

        assert!(reply.error.is_none());
        assert!(reply.generated.is_none());
        let bundle = context.projects.get("s1").await.unwrap().unwrap();
        assert!(bundle.characters.iter().any(|c| c.name == "Lin Feng" && c.role == quill_memory::CharacterRole::Protagonist));
        assert_eq!(bundle.world.genre, "cyberpunk");
    }

    #[tokio::test]
    async fn explicit_generate_turn_produces_a_current_chapter() {
        let context = build_context();
        chat(
            &context,
            ChatRequest {
                session_id: Some("s2".to_string()),
                message: "I want a 2077 Shanghai cyberpunk novel, protagonist Lin Feng, ex-detective hunting a missing AI".to_string(),
                project_id: None,
            },
        )
        .await;

        let reply = chat(&context, ChatRequest { session_id: Some("s2".to_string()), message: "write chapter 1".to_string(), project_id: None }).await;

        assert!(reply.error.is_none());
        let generated = reply.generated.expect("chapter should have been generated");
        assert_eq!(generated.chapter_number, 1);
        assert!(generated.word_count > 0);
        let current = context.chapters.get_current("s2", 1).await.unwrap();
        assert!(current.is_some());
    }

    #[tokio::test]
    async fn concurrent_generate_chapter_calls_coalesce_to_one_record() {
        let context = build_context();
        context.projects.create("p1").await.unwrap();

        let a = generate_chapter(&context, "p1", 5, GenerationMode::Full, None);
        let b = generate_chapter(&context, "p1", 5, GenerationMode::Full, None);
        let (first, second) = tokio::join!(a, b);
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first.record.id, second.record.id);
        assert!(first.coalesced != second.coalesced);
        let history = context.chapters.list("p1").await.unwrap();
        assert_eq!(history.iter().filter(|r| r.chapter_number == 5).count(), 1);
    }

    #[tokio::test]
    async fn contradiction_blocks_generation_and_asks_for_clarification() {
        let context = build_context();
        chat(
            &context,
            ChatRequest {
                session_id: Some("s3".to_string()),
                message: "I want a fantasy novel where magic exists".to_string(),
                project_id: None,
            },
        )
        .await;

        let reply = chat(
            &context,
            ChatRequest { session_id: Some("s3".to_string()), message: "actually there's no magic at all in this world".to_string(), project_id: None },
        )
        .await;

        assert!(reply.generated.is_none());
        assert!(reply.consistency.as_ref().is_some_and(|r| r.has_errors()));
    }

    #[tokio::test]
    async fn cancelling_a_stream_before_its_llm_call_returns_stops_it_short() {
        let context = Arc::new(AgentContext::new(
            Arc::new(InMemoryMemoryRepository::default()),
            Arc::new(InMemoryProjectRepository::default()),
            Arc::new(InMemoryChapterRepository::default()),
            Arc::new(InMemorySessionRepository::default()),
            Arc::new(InMemoryVectorStore::default()),
            Arc::new(LlmGateway::new(Box::new(MockProvider::slow(std::time::Duration::from_secs(30))))),
            AppConfig::default(),
        ));

        let cancel = CancellationToken::new();
        let mut rx = chat_stream(
            context,
            ChatRequest { session_id: Some("cancel-1".to_string()), message: "I want a fantasy novel".to_string(), project_id: None },
            cancel.clone(),
        )
        .await;

        cancel.cancel();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("cancellation should stop the stream well before the slow provider would reply");
        assert!(event.is_none(), "no events should be emitted once the turn is cancelled mid-flight");
    }
}
