use serde::{Deserialize, Serialize};

pub type Id = u64;

/// Lifecycle of a document. `Ready` is re-entered every time Analyze runs again;
/// `Failed` is only left by a fresh Parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn can_become(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Processing, Ready) | (Processing, Failed) | (Ready, Ready) | (Failed, Ready)
        )
    }
}

/// Lifecycle of a chapter. `Processing` is re-enterable: re-running Segment or
/// Generate on a completed or failed chapter is always legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChapterStatus {
    pub fn can_become(self, next: ChapterStatus) -> bool {
        use ChapterStatus::*;
        match (self, next) {
            (_, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Id,
    pub title: String,
    pub author: String,
    pub source_path: String,
    pub cover_path: Option<String>,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: Id,
    pub document_id: Id,
    /// 1-based, unique and gap-free per document in parse order.
    pub position: u32,
    pub title: String,
    pub text: String,
    pub status: ChapterStatus,
    /// 0..=100, committed after every segment during Generate.
    pub progress: u8,
    pub audio_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: Id,
    pub document_id: Id,
    /// Unique per document, case-insensitive.
    pub name: String,
    pub gender: String,
    pub age_category: String,
    pub tone: String,
    pub voice_quality: String,
    pub description: String,
    pub voice_id: Option<String>,
}

/// Who speaks a segment. The narrator is its own variant rather than a missing
/// character reference, so "explicitly the narrator" and "unresolved" can never
/// be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Speaker {
    Narrator,
    Character(Id),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Id,
    pub chapter_id: Id,
    pub text: String,
    pub speaker: Speaker,
    pub audio_path: Option<String>,
}

// --- Draft types (rows before the store assigns an id) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDraft {
    pub position: u32,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct CharacterDraft {
    pub name: String,
    pub gender: String,
    pub age_category: String,
    pub tone: String,
    pub voice_quality: String,
    pub description: String,
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDraft {
    pub text: String,
    pub speaker: Speaker,
}
