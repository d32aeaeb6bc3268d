//! The repository interface: four async traits the core depends on
//! abstractly. Persistence backing (ORM, migrations, cache) is an
//! external collaborator's concern; this module defines only the trait
//! boundary plus the in-memory implementations needed to run the core and
//! its tests without one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{ChapterState, ExtractedSettingsBundle, GenerationRecord, MemoryItem, MemoryTier, Session, Turn};
use crate::error::MemoryError;

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn add(&self, item: MemoryItem) -> Result<Uuid, MemoryError>;
    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut MemoryItem) + Send>) -> Result<(), MemoryError>;
    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>, MemoryError>;
    async fn delete(&self, id: Uuid) -> Result<bool, MemoryError>;
    async fn list(&self, level: MemoryTier, limit: Option<usize>) -> Result<Vec<MemoryItem>, MemoryError>;
    async fn all(&self) -> Result<Vec<MemoryItem>, MemoryError>;
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create(&self, project_id: &str) -> Result<(), MemoryError>;
    async fn get(&self, project_id: &str) -> Result<Option<ExtractedSettingsBundle>, MemoryError>;
    async fn update(&self, project_id: &str, bundle: ExtractedSettingsBundle) -> Result<(), MemoryError>;
    /// Deletes a project and, per the project lifecycle rule, all of
    /// its memory and generation records.
    async fn delete(&self, project_id: &str) -> Result<(), MemoryError>;
    async fn list(&self) -> Result<Vec<String>, MemoryError>;
}

#[async_trait]
pub trait ChapterRepository: Send + Sync {
    async fn add(&self, record: GenerationRecord) -> Result<(), MemoryError>;
    async fn get(&self, project_id: &str, record_id: Uuid) -> Result<Option<GenerationRecord>, MemoryError>;
    async fn get_current(&self, project_id: &str, chapter_number: u32) -> Result<Option<GenerationRecord>, MemoryError>;
    async fn list(&self, project_id: &str) -> Result<Vec<GenerationRecord>, MemoryError>;
    /// Marks `record_id` CURRENT and demotes any prior CURRENT record for
    /// the same `(project_id, chapter_number)` to HISTORY. At most one
    /// record is CURRENT for a given chapter number at any time.
    async fn set_current(&self, project_id: &str, chapter_number: u32, record_id: Uuid) -> Result<(), MemoryError>;
    async fn history(&self, project_id: &str, chapter_number: u32) -> Result<Vec<GenerationRecord>, MemoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session_id: &str, project_id: Option<String>) -> Result<Session, MemoryError>;
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), MemoryError>;
    async fn load(&self, session_id: &str) -> Result<Option<Session>, MemoryError>;
    async fn evict(&self, session_id: &str, keep_last: usize) -> Result<Vec<Turn>, MemoryError>;
}

/// In-memory `MemoryRepository`, the default implementation.
#[derive(Default)]
pub struct InMemoryMemoryRepository {
    items: RwLock<HashMap<Uuid, MemoryItem>>,
}

#[async_trait]
impl MemoryRepository for InMemoryMemoryRepository {
    async fn add(&self, item: MemoryItem) -> Result<Uuid, MemoryError> {
        let id = item.id;
        self.items.write().await.insert(id, item);
        Ok(id)
    }

    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut MemoryItem) + Send>) -> Result<(), MemoryError> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&id).ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let previous_hash = item.content_hash.clone();
        patch(item);
        item.content_hash = crate::domain::content_hash(&item.content);
        if item.content_hash != previous_hash {
            item.embedding = None;
        }
        item.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>, MemoryError> {
        Ok(self.items.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MemoryError> {
        Ok(self.items.write().await.remove(&id).is_some())
    }

    async fn list(&self, level: MemoryTier, limit: Option<usize>) -> Result<Vec<MemoryItem>, MemoryError> {
        let items = self.items.read().await;
        let mut matching: Vec<MemoryItem> = items.values().filter(|i| i.level == level).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn all(&self) -> Result<Vec<MemoryItem>, MemoryError> {
        Ok(self.items.read().await.values().cloned().collect())
    }
}

/// `MemoryRepository` backed by the crash-safe JSONL event log, kept as a
/// second illustrative implementation of the same trait.
pub struct JsonlMemoryRepository {
    log: crate::event_log::MemoryEventLog,
    cache: Arc<InMemoryMemoryRepository>,
}

impl JsonlMemoryRepository {
    /// Replays the log into the in-memory cache. Quarantined/malformed
    /// entries are skipped by the log's own loader; this only fails if the
    /// file itself can't be read.
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, MemoryError> {
        let log = crate::event_log::MemoryEventLog::new(path);
        let cache = Arc::new(InMemoryMemoryRepository::default());
        for event in log.load().await? {
            cache.items.write().await.insert(event.item.id, event.item);
        }
        Ok(Self { log, cache })
    }

    async fn persist_snapshot(&self) -> Result<(), MemoryError> {
        let items = self.cache.items.read().await;
        let events: Vec<_> = items
            .values()
            .map(|item| crate::event_log::MemoryRecordEvent {
                event_id: Uuid::new_v4(),
                occurred_at: chrono::Utc::now(),
                item: item.clone(),
            })
            .collect();
        self.log.overwrite(&events).await
    }
}

#[async_trait]
impl MemoryRepository for JsonlMemoryRepository {
    async fn add(&self, item: MemoryItem) -> Result<Uuid, MemoryError> {
        let event = crate::event_log::MemoryRecordEvent { event_id: Uuid::new_v4(), occurred_at: chrono::Utc::now(), item: item.clone() };
        self.log.append(&event).await?;
        self.cache.add(item).await
    }

    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut MemoryItem) + Send>) -> Result<(), MemoryError> {
        self.cache.update(id, patch).await?;
        self.persist_snapshot().await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>, MemoryError> {
        self.cache.get(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MemoryError> {
        let removed = self.cache.delete(id).await?;
        if removed {
            self.persist_snapshot().await?;
        }
        Ok(removed)
    }

    async fn list(&self, level: MemoryTier, limit: Option<usize>) -> Result<Vec<MemoryItem>, MemoryError> {
        self.cache.list(level, limit).await
    }

    async fn all(&self) -> Result<Vec<MemoryItem>, MemoryError> {
        self.cache.all().await
    }
}

#[derive(Default)]
pub struct InMemoryProjectRepository {
    projects: RwLock<HashMap<String, ExtractedSettingsBundle>>,
}

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn create(&self, project_id: &str) -> Result<(), MemoryError> {
        self.projects.write().await.entry(project_id.to_string()).or_default();
        Ok(())
    }

    async fn get(&self, project_id: &str) -> Result<Option<ExtractedSettingsBundle>, MemoryError> {
        Ok(self.projects.read().await.get(project_id).cloned())
    }

    async fn update(&self, project_id: &str, bundle: ExtractedSettingsBundle) -> Result<(), MemoryError> {
        self.projects.write().await.insert(project_id.to_string(), bundle);
        Ok(())
    }

    async fn delete(&self, project_id: &str) -> Result<(), MemoryError> {
        self.projects.write().await.remove(project_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, MemoryError> {
        Ok(self.projects.read().await.keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryChapterRepository {
    records: RwLock<HashMap<Uuid, GenerationRecord>>,
}

#[async_trait]
impl ChapterRepository for InMemoryChapterRepository {
    async fn add(&self, record: GenerationRecord) -> Result<(), MemoryError> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, project_id: &str, record_id: Uuid) -> Result<Option<GenerationRecord>, MemoryError> {
        Ok(self.records.read().await.get(&record_id).filter(|r| r.project_id == project_id).cloned())
    }

    async fn get_current(&self, project_id: &str, chapter_number: u32) -> Result<Option<GenerationRecord>, MemoryError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.project_id == project_id && r.chapter_number == chapter_number && r.state == ChapterState::Current)
            .cloned())
    }

    async fn list(&self, project_id: &str) -> Result<Vec<GenerationRecord>, MemoryError> {
        Ok(self.records.read().await.values().filter(|r| r.project_id == project_id).cloned().collect())
    }

    async fn set_current(&self, project_id: &str, chapter_number: u32, record_id: Uuid) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            if record.project_id == project_id && record.chapter_number == chapter_number && record.state == ChapterState::Current {
                record.state = ChapterState::History;
            }
        }
        let record = records.get_mut(&record_id).ok_or_else(|| MemoryError::NotFound(record_id.to_string()))?;
        record.state = ChapterState::Current;
        Ok(())
    }

    async fn history(&self, project_id: &str, chapter_number: u32) -> Result<Vec<GenerationRecord>, MemoryError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.project_id == project_id && r.chapter_number == chapter_number && r.state == ChapterState::History)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session_id: &str, project_id: Option<String>) -> Result<Session, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| Session::new(session_id, project_id));
        Ok(session.clone())
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| MemoryError::NotFound(session_id.to_string()))?;
        session.turns.push(turn);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, MemoryError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn evict(&self, session_id: &str, keep_last: usize) -> Result<Vec<Turn>, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| MemoryError::NotFound(session_id.to_string()))?;
        if session.turns.len() <= keep_last {
            return Ok(Vec::new());
        }
        let evict_count = session.turns.len() - keep_last;
        Ok(session.turns.drain(0..evict_count).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GenerationMode, MemoryTier, TurnRole};

    #[tokio::test]
    async fn at_most_one_current_record_per_chapter_number() {
        let repo = InMemoryChapterRepository::default();
        let first = GenerationRecord {
            id: Uuid::new_v4(),
            project_id: "p1".to_string(),
            chapter_number: 1,
            mode: GenerationMode::Full,
            content: "draft one".to_string(),
            word_count: 2,
            parent_id: None,
            state: ChapterState::Draft,
            created_at: chrono::Utc::now(),
            settings_fingerprint: "a".to_string(),
        };
        let second = GenerationRecord { id: Uuid::new_v4(), state: ChapterState::Draft, ..first.clone() };

        repo.add(first.clone()).await.unwrap();
        repo.add(second.clone()).await.unwrap();
        repo.set_current("p1", 1, first.id).await.unwrap();
        repo.set_current("p1", 1, second.id).await.unwrap();

        let current = repo.get_current("p1", 1).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        let history = repo.history("p1", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, first.id);
    }

    #[tokio::test]
    async fn session_evict_returns_oldest_turns_beyond_cap() {
        let repo = InMemorySessionRepository::default();
        repo.create("s1", None).await.unwrap();
        for i in 0..5 {
            repo.append_turn("s1", Turn { role: TurnRole::User, text: format!("turn {i}"), ts: chrono::Utc::now() }).await.unwrap();
        }
        let evicted = repo.evict("s1", 3).await.unwrap();
        assert_eq!(evicted.len(), 2);
        let session = repo.load("s1").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 3);
    }

    #[tokio::test]
    async fn update_recomputes_content_hash_and_clears_stale_embedding() {
        let repo = InMemoryMemoryRepository::default();
        let mut item = MemoryItem::new(MemoryTier::Global, "original");
        item.embedding = Some(vec![0.1]);
        let id = repo.add(item).await.unwrap();

        repo.update(id, Box::new(|item| item.content = "changed".to_string())).await.unwrap();
        let updated = repo.get(id).await.unwrap().unwrap();
        assert!(updated.embedding.is_none());
        assert_eq!(updated.content_hash, crate::domain::content_hash("changed"));
    }
}
