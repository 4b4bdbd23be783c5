use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::io::Storage;
use crate::core::model::{
    Chapter, ChapterDraft, ChapterStatus, Character, CharacterDraft, Document, DocumentStatus, Id,
    Segment, SegmentDraft,
};

/// Keyed CRUD for the four pipeline entities. Chapters read back in position
/// order, segments in insertion order; `replace_segments` swaps a chapter's
/// whole segment set in one call.
#[async_trait]
pub trait Library: Send + Sync {
    async fn create_document(&self, title: &str, author: &str, source_path: &str)
        -> Result<Document>;
    async fn document(&self, id: Id) -> Result<Option<Document>>;
    async fn put_document(&self, document: &Document) -> Result<()>;
    /// Removes the document and everything hanging off it: chapters,
    /// characters, segments and audio artifacts.
    async fn delete_document(&self, id: Id) -> Result<()>;

    /// Swaps the document's whole chapter list (old chapters, their segments
    /// and audio go away), so re-running Parse never duplicates.
    async fn replace_chapters(
        &self,
        document_id: Id,
        drafts: Vec<ChapterDraft>,
    ) -> Result<Vec<Chapter>>;
    async fn chapter(&self, id: Id) -> Result<Option<Chapter>>;
    async fn put_chapter(&self, chapter: &Chapter) -> Result<()>;
    async fn chapters_by_document(&self, document_id: Id) -> Result<Vec<Chapter>>;

    async fn insert_character(&self, document_id: Id, draft: CharacterDraft) -> Result<Character>;
    async fn put_character(&self, character: &Character) -> Result<()>;
    async fn characters_by_document(&self, document_id: Id) -> Result<Vec<Character>>;

    async fn replace_segments(
        &self,
        chapter_id: Id,
        drafts: Vec<SegmentDraft>,
    ) -> Result<Vec<Segment>>;
    async fn insert_segment(&self, chapter_id: Id, draft: SegmentDraft) -> Result<Segment>;
    async fn put_segment(&self, segment: &Segment) -> Result<()>;
    async fn segments_by_chapter(&self, chapter_id: Id) -> Result<Vec<Segment>>;
}

/// One JSON file per row under `<root>/{documents,chapters,characters,segments}`.
/// Ids are monotonic across all entity kinds; insertion order is id order.
pub struct JsonLibrary {
    root: PathBuf,
    storage: Arc<dyn Storage>,
    next_id: AtomicU64,
}

const KIND_DOCUMENTS: &str = "documents";
const KIND_CHAPTERS: &str = "chapters";
const KIND_CHARACTERS: &str = "characters";
const KIND_SEGMENTS: &str = "segments";

impl JsonLibrary {
    pub async fn open(root: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Result<Self> {
        let root = root.into();
        let mut max_id = 0u64;
        for kind in [KIND_DOCUMENTS, KIND_CHAPTERS, KIND_CHARACTERS, KIND_SEGMENTS] {
            let dir = root.join(kind);
            for entry in storage.list(&dir.to_string_lossy()).await? {
                if let Some(id) = id_from_path(&entry) {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok(Self {
            root,
            storage,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    fn alloc_id(&self) -> Id {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn row_path(&self, kind: &str, id: Id) -> String {
        self.root
            .join(kind)
            .join(format!("{id}.json"))
            .to_string_lossy()
            .to_string()
    }

    async fn write_row<T: Serialize>(&self, kind: &str, id: Id, row: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(row).context("serialize row")?;
        self.storage.write(&self.row_path(kind, id), &data).await
    }

    async fn read_row<T: DeserializeOwned>(&self, kind: &str, id: Id) -> Result<Option<T>> {
        let path = self.row_path(kind, id);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&path).await?;
        let row = serde_json::from_slice(&bytes).with_context(|| format!("parse {path}"))?;
        Ok(Some(row))
    }

    async fn read_all<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        let mut rows = Vec::new();
        for entry in self.storage.list(&dir.to_string_lossy()).await? {
            if id_from_path(&entry).is_none() {
                continue;
            }
            let bytes = self.storage.read(&entry).await?;
            rows.push(serde_json::from_slice(&bytes).with_context(|| format!("parse {entry}"))?);
        }
        Ok(rows)
    }

    async fn delete_row(&self, kind: &str, id: Id) -> Result<()> {
        self.storage.delete(&self.row_path(kind, id)).await
    }
}

fn id_from_path(path: &str) -> Option<Id> {
    Path::new(path)
        .file_name()?
        .to_str()?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[async_trait]
impl Library for JsonLibrary {
    async fn create_document(
        &self,
        title: &str,
        author: &str,
        source_path: &str,
    ) -> Result<Document> {
        let document = Document {
            id: self.alloc_id(),
            title: title.to_string(),
            author: author.to_string(),
            source_path: source_path.to_string(),
            cover_path: None,
            status: DocumentStatus::Processing,
        };
        self.write_row(KIND_DOCUMENTS, document.id, &document).await?;
        Ok(document)
    }

    async fn document(&self, id: Id) -> Result<Option<Document>> {
        self.read_row(KIND_DOCUMENTS, id).await
    }

    async fn put_document(&self, document: &Document) -> Result<()> {
        self.write_row(KIND_DOCUMENTS, document.id, document).await
    }

    async fn delete_document(&self, id: Id) -> Result<()> {
        for chapter in self.chapters_by_document(id).await? {
            for segment in self.segments_by_chapter(chapter.id).await? {
                self.delete_row(KIND_SEGMENTS, segment.id).await?;
            }
            if let Some(dir) = &chapter.audio_dir {
                self.storage.delete(dir).await?;
            }
            self.delete_row(KIND_CHAPTERS, chapter.id).await?;
        }
        for character in self.characters_by_document(id).await? {
            self.delete_row(KIND_CHARACTERS, character.id).await?;
        }
        self.delete_row(KIND_DOCUMENTS, id).await
    }

    async fn replace_chapters(
        &self,
        document_id: Id,
        drafts: Vec<ChapterDraft>,
    ) -> Result<Vec<Chapter>> {
        for old in self.chapters_by_document(document_id).await? {
            for segment in self.segments_by_chapter(old.id).await? {
                self.delete_row(KIND_SEGMENTS, segment.id).await?;
            }
            if let Some(dir) = &old.audio_dir {
                self.storage.delete(dir).await?;
            }
            self.delete_row(KIND_CHAPTERS, old.id).await?;
        }
        let mut chapters = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let chapter = Chapter {
                id: self.alloc_id(),
                document_id,
                position: draft.position,
                title: draft.title,
                text: draft.text,
                status: ChapterStatus::Pending,
                progress: 0,
                audio_dir: None,
            };
            self.write_row(KIND_CHAPTERS, chapter.id, &chapter).await?;
            chapters.push(chapter);
        }
        Ok(chapters)
    }

    async fn chapter(&self, id: Id) -> Result<Option<Chapter>> {
        self.read_row(KIND_CHAPTERS, id).await
    }

    async fn put_chapter(&self, chapter: &Chapter) -> Result<()> {
        self.write_row(KIND_CHAPTERS, chapter.id, chapter).await
    }

    async fn chapters_by_document(&self, document_id: Id) -> Result<Vec<Chapter>> {
        let mut chapters: Vec<Chapter> = self
            .read_all(KIND_CHAPTERS)
            .await?
            .into_iter()
            .filter(|c: &Chapter| c.document_id == document_id)
            .collect();
        chapters.sort_by_key(|c| c.position);
        Ok(chapters)
    }

    async fn insert_character(&self, document_id: Id, draft: CharacterDraft) -> Result<Character> {
        let character = Character {
            id: self.alloc_id(),
            document_id,
            name: draft.name,
            gender: draft.gender,
            age_category: draft.age_category,
            tone: draft.tone,
            voice_quality: draft.voice_quality,
            description: draft.description,
            voice_id: draft.voice_id,
        };
        self.write_row(KIND_CHARACTERS, character.id, &character).await?;
        Ok(character)
    }

    async fn put_character(&self, character: &Character) -> Result<()> {
        self.write_row(KIND_CHARACTERS, character.id, character).await
    }

    async fn characters_by_document(&self, document_id: Id) -> Result<Vec<Character>> {
        let mut characters: Vec<Character> = self
            .read_all(KIND_CHARACTERS)
            .await?
            .into_iter()
            .filter(|c: &Character| c.document_id == document_id)
            .collect();
        characters.sort_by_key(|c| c.id);
        Ok(characters)
    }

    async fn replace_segments(
        &self,
        chapter_id: Id,
        drafts: Vec<SegmentDraft>,
    ) -> Result<Vec<Segment>> {
        for old in self.segments_by_chapter(chapter_id).await? {
            self.delete_row(KIND_SEGMENTS, old.id).await?;
        }
        let mut segments = Vec::with_capacity(drafts.len());
        for draft in drafts {
            segments.push(self.insert_segment(chapter_id, draft).await?);
        }
        Ok(segments)
    }

    async fn insert_segment(&self, chapter_id: Id, draft: SegmentDraft) -> Result<Segment> {
        let segment = Segment {
            id: self.alloc_id(),
            chapter_id,
            text: draft.text,
            speaker: draft.speaker,
            audio_path: None,
        };
        self.write_row(KIND_SEGMENTS, segment.id, &segment).await?;
        Ok(segment)
    }

    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        self.write_row(KIND_SEGMENTS, segment.id, segment).await
    }

    async fn segments_by_chapter(&self, chapter_id: Id) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = self
            .read_all(KIND_SEGMENTS)
            .await?
            .into_iter()
            .filter(|s: &Segment| s.chapter_id == chapter_id)
            .collect();
        segments.sort_by_key(|s| s.id);
        Ok(segments)
    }
}
