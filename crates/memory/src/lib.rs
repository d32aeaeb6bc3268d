//! Layered memory: the five-tier `MemoryItem` store, hybrid
//! lexical+vector search, `build_context` budget-bounded retrieval, the
//! `VectorStore` abstraction, and the Repository traits (memory/project/
//! chapter/session) the core depends on abstractly.

pub mod domain;
pub mod error;
pub mod event_log;
pub mod repository;
pub mod retrieval;
pub mod vector;

pub use domain::{
    ChapterState, CharacterProfile, CharacterRole, ConsistencyIssue, ConsistencyReport,
    ExtractedSettingsBundle, GenerationMode, GenerationRecord, IssueSeverity, MemoryItem,
    MemoryTier, PlotKind, PlotPoint, Session, SettingEdit, Turn, TurnRole, WorldField,
    WorldSetting, content_hash,
};
pub use error::MemoryError;
pub use repository::{
    ChapterRepository, InMemoryChapterRepository, InMemoryMemoryRepository,
    InMemoryProjectRepository, InMemorySessionRepository, JsonlMemoryRepository, MemoryRepository,
    ProjectRepository, SessionRepository,
};
pub use retrieval::{RankedItem, build_context, search};
pub use vector::{InMemoryVectorStore, VectorStore};
