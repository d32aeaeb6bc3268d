//! `AgentContext`: the single dependency-injection struct replacing global
//! state, built once at process start (in `crates/runtime`) and passed by
//! `Arc` into every Agent API call. Carries the four repositories, the
//! gateway, the vector store, the config, and two concurrency primitives:
//! a per-`session_id` mutex table and a per-`(project_id, chapter_number)`
//! single-flight generation table.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::Shared;
use quill_config::AppConfig;
use quill_llm::LlmGateway;
use quill_memory::{
    ChapterRepository, GenerationRecord, MemoryRepository, ProjectRepository, SessionRepository, VectorStore,
};
use tokio::sync::Mutex;

use crate::error::CoreError;

pub type ChapterKey = (String, u32);
pub type GenerationFuture = Shared<futures::future::BoxFuture<'static, Arc<Result<GenerationRecord, CoreError>>>>;

/// Constructed exactly once per process and held behind an `Arc`. No
/// `static`/`lazy_static`/global lives anywhere in this crate; every
/// dependency a turn needs is reached through this value.
pub struct AgentContext {
    pub memory: Arc<dyn MemoryRepository>,
    pub projects: Arc<dyn ProjectRepository>,
    pub chapters: Arc<dyn ChapterRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub vectors: Arc<dyn VectorStore>,
    pub gateway: Arc<LlmGateway>,
    pub config: AppConfig,

    /// Serializes turns within one `session_id`; a new turn waits for the
    /// prior turn's full pipeline (through the end-of-turn memory commit)
    /// to finish. Turns on different sessions proceed independently.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Single-flight slot per `(project_id, chapter_number)`: the first
    /// caller for a key stores its in-flight future here; later callers for
    /// the same key `.await` the same `Shared` future instead of starting a
    /// second generation, satisfying the "default: coalesce" requirement.
    generation_slots: DashMap<ChapterKey, Arc<Mutex<Option<GenerationFuture>>>>,
}

impl AgentContext {
    pub fn new(
        memory: Arc<dyn MemoryRepository>,
        projects: Arc<dyn ProjectRepository>,
        chapters: Arc<dyn ChapterRepository>,
        sessions: Arc<dyn SessionRepository>,
        vectors: Arc<dyn VectorStore>,
        gateway: Arc<LlmGateway>,
        config: AppConfig,
    ) -> Self {
        Self {
            memory,
            projects,
            chapters,
            sessions,
            vectors,
            gateway,
            config,
            session_locks: DashMap::new(),
            generation_slots: DashMap::new(),
        }
    }

    pub fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn generation_slot(&self, key: ChapterKey) -> Arc<Mutex<Option<GenerationFuture>>> {
        self.generation_slots.entry(key).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    /// Drops a key's single-flight slot once its in-flight future has
    /// resolved, so a later, unrelated call for the same key starts a fresh
    /// generation rather than rejoining a stale one.
    pub fn clear_generation_slot(&self, key: &ChapterKey) {
        self.generation_slots.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_llm::MockProvider;
    use quill_memory::{
        InMemoryChapterRepository, InMemoryMemoryRepository, InMemoryProjectRepository, InMemorySessionRepository,
        InMemoryVectorStore,
    };

    fn build_context() -> AgentContext {
        AgentContext::new(
            Arc::new(InMemoryMemoryRepository::default()),
            Arc::new(InMemoryProjectRepository::default()),
            Arc::new(InMemoryChapterRepository::default()),
            Arc::new(InMemorySessionRepository::default()),
            Arc::new(InMemoryVectorStore::default()),
            Arc::new(LlmGateway::new(Box::new(MockProvider::echo()))),
            AppConfig::default(),
        )
    }

    #[test]
    fn session_lock_is_stable_for_the_same_session_id() {
        let context = build_context();
        let a = context.session_lock("s1");
        let b = context.session_lock("s1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn generation_slot_is_stable_for_the_same_key_until_cleared() {
        let context = build_context();
        let key = ("p1".to_string(), 1u32);
        let a = context.generation_slot(key.clone());
        let b = context.generation_slot(key.clone());
        assert!(Arc::ptr_eq(&a, &b));
        context.clear_generation_slot(&key);
        let c = context.generation_slot(key);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
