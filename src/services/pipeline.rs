use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use log::{info, warn};
use tokio::time::timeout;

use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::library::Library;
use crate::core::model::{
    Chapter, ChapterDraft, ChapterStatus, Character, CharacterDraft, Document, DocumentStatus, Id,
    SegmentDraft, Speaker,
};
use crate::services::analysis::{AnalysisProvider, RosterEntry, SpeakerRef};
use crate::services::assigner::assign_speakers;
use crate::services::parser::DocumentParser;
use crate::services::tts::SynthesisProvider;
use crate::services::voices::{resolve_segment_voice, VoiceRegistry, VoiceTraits};

const NARRATOR_NAME: &str = "Narrator";

/// One unit of pipeline work, keyed by a document or chapter id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Analyze,
    Segment,
    Generate,
}

/// Sequences Parse → Analyze → Segment → Generate over the library. Every
/// stage is independently triggerable and idempotent; providers come in
/// through the constructor and are the only places the pipeline blocks for
/// long. No store access spans a provider call: each stage loads what it
/// needs, releases, calls out, then persists in a fresh scope.
pub struct Pipeline {
    config: Config,
    library: Arc<dyn Library>,
    storage: Arc<dyn Storage>,
    parser: Box<dyn DocumentParser>,
    analysis: Box<dyn AnalysisProvider>,
    synthesis: Box<dyn SynthesisProvider>,
    registry: VoiceRegistry,
    // Advisory per-chapter locks so Segment and Generate on the same chapter
    // serialize instead of racing on the segment set.
    chapter_locks: Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        library: Arc<dyn Library>,
        storage: Arc<dyn Storage>,
        parser: Box<dyn DocumentParser>,
        analysis: Box<dyn AnalysisProvider>,
        synthesis: Box<dyn SynthesisProvider>,
    ) -> Self {
        Self {
            config,
            library,
            storage,
            parser,
            analysis,
            synthesis,
            registry: VoiceRegistry::new(),
            chapter_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the document row for an uploaded source file. The filename
    /// stands in for the title until Parse reads the real metadata.
    pub async fn register_document(&self, source_path: &str) -> Result<Document> {
        let title = Path::new(source_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source_path.to_string());
        let document = self
            .library
            .create_document(&title, "Unknown", source_path)
            .await?;
        info!("registered document {} from {source_path}", document.id);
        Ok(document)
    }

    /// Reads the source file and replaces the document's metadata and chapter
    /// list. On parser failure the document goes to Failed with no chapters;
    /// there is no automatic retry and the failure surfaces only through the
    /// document status.
    pub async fn parse(&self, document_id: Id) -> Result<()> {
        let Some(mut document) = self.library.document(document_id).await? else {
            return Err(anyhow!("document {document_id} not found"));
        };

        let parsed = match self.parser.parse(&document.source_path) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("parse failed for document {document_id}: {e:#}");
                advance_document(&mut document, DocumentStatus::Failed);
                self.library.put_document(&document).await?;
                return Ok(());
            }
        };

        document.title = parsed.title;
        document.author = parsed.author;
        document.cover_path = parsed.cover_path;
        advance_document(&mut document, DocumentStatus::Ready);
        self.library.put_document(&document).await?;

        let count = parsed.chapters.len();
        self.library
            .replace_chapters(
                document_id,
                parsed
                    .chapters
                    .into_iter()
                    .map(|c| ChapterDraft {
                        position: c.position,
                        title: c.title,
                        text: c.text,
                    })
                    .collect(),
            )
            .await?;

        info!("parsed document {document_id}: {count} chapters");
        Ok(())
    }

    /// Runs character analysis over the leading chapters and refreshes the
    /// roster, guaranteeing a Narrator afterwards. Provider trouble is
    /// absorbed: the document still reaches Ready, just with no characters
    /// beyond the synthesized Narrator. A document with no chapters is left
    /// completely untouched.
    pub async fn analyze(&self, document_id: Id) -> Result<()> {
        if self.library.document(document_id).await?.is_none() {
            return Err(anyhow!("document {document_id} not found"));
        }
        let chapters = self.library.chapters_by_document(document_id).await?;
        if chapters.is_empty() {
            info!("document {document_id} has no chapters to analyze");
            return Ok(());
        }

        let combined = chapters
            .iter()
            .take(self.config.analysis_chapters)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        drop(chapters);

        let roster = match timeout(
            self.config.external_call_timeout(),
            self.analysis.analyze_roster(&combined),
        )
        .await
        {
            Ok(Ok(roster)) => roster,
            Ok(Err(e)) => {
                warn!("character analysis failed for document {document_id}, continuing with empty roster: {e:#}");
                Vec::new()
            }
            Err(_) => {
                warn!("character analysis timed out for document {document_id}");
                Vec::new()
            }
        };

        let found = roster.len();
        for entry in roster {
            let voice = self.registry.find_best_match(
                Some(&entry.gender),
                Some(&entry.age_category),
                Some(&entry.tone),
                Some(&entry.voice_quality),
                &self.config.locale,
            );
            self.upsert_character(document_id, entry, voice).await?;
        }

        self.ensure_narrator(document_id).await?;

        let Some(mut document) = self.library.document(document_id).await? else {
            return Err(anyhow!("document {document_id} disappeared during analysis"));
        };
        advance_document(&mut document, DocumentStatus::Ready);
        self.library.put_document(&document).await?;

        info!("analysis complete for document {document_id}: {found} characters from provider");
        Ok(())
    }

    /// Splits the chapter into speaker-tagged segments, replacing whatever
    /// segments it had. Provider trouble degrades to one full-text Narrator
    /// segment; the chapter never ends up with zero segments.
    pub async fn segment(&self, chapter_id: Id) -> Result<()> {
        let lock = self.chapter_lock(chapter_id);
        let _guard = lock.lock().await;

        let Some(chapter) = self.library.chapter(chapter_id).await? else {
            return Err(anyhow!("chapter {chapter_id} not found"));
        };
        let characters = self
            .library
            .characters_by_document(chapter.document_id)
            .await?;
        let speaker_refs: Vec<SpeakerRef> = characters
            .iter()
            .map(|c| SpeakerRef {
                name: c.name.clone(),
                gender: c.gender.clone(),
            })
            .collect();
        let roster: Vec<(Id, String)> =
            characters.iter().map(|c| (c.id, c.name.clone())).collect();
        let text = chapter.text.clone();
        drop(characters);

        let raw = match timeout(
            self.config.external_call_timeout(),
            self.analysis.assign_roles(&text, &speaker_refs),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("role assignment failed for chapter {chapter_id}, falling back to narrator: {e:#}");
                Vec::new()
            }
            Err(_) => {
                warn!("role assignment timed out for chapter {chapter_id}");
                Vec::new()
            }
        };

        let drafts = assign_speakers(raw, &roster, &text);
        let count = drafts.len();

        let Some(mut chapter) = self.library.chapter(chapter_id).await? else {
            return Err(anyhow!("chapter {chapter_id} disappeared during segmentation"));
        };
        self.library.replace_segments(chapter_id, drafts).await?;
        advance_chapter(&mut chapter, ChapterStatus::Processing);
        self.library.put_chapter(&chapter).await?;

        info!("segmented chapter {chapter_id} into {count} segments");
        Ok(())
    }

    /// Walks the chapter's segments in order, synthesizing audio for each and
    /// committing progress after every one. A failed segment is skipped, not
    /// fatal; the chapter completes if at least one artifact exists, and
    /// fails (progress 0, no audio directory) only when none do.
    pub async fn generate(&self, chapter_id: Id) -> Result<()> {
        let lock = self.chapter_lock(chapter_id);
        let _guard = lock.lock().await;

        let Some(mut chapter) = self.library.chapter(chapter_id).await? else {
            return Err(anyhow!("chapter {chapter_id} not found"));
        };
        // Visible before the first long synthesis call starts.
        advance_chapter(&mut chapter, ChapterStatus::Processing);
        self.library.put_chapter(&chapter).await?;

        let mut segments = self.library.segments_by_chapter(chapter_id).await?;
        if segments.is_empty() {
            info!("chapter {chapter_id} has no segments, synthesizing one from the full text");
            let fallback = self
                .library
                .insert_segment(
                    chapter_id,
                    SegmentDraft {
                        text: chapter.text.clone(),
                        speaker: Speaker::Narrator,
                    },
                )
                .await?;
            segments = vec![fallback];
        }

        let characters = self
            .library
            .characters_by_document(chapter.document_id)
            .await?;
        let narrator_id = characters
            .iter()
            .find(|c| c.name.trim().eq_ignore_ascii_case(NARRATOR_NAME))
            .map(|c| c.id);
        let traits: HashMap<Id, VoiceTraits> = characters
            .into_iter()
            .map(|c| {
                (
                    c.id,
                    VoiceTraits {
                        voice_id: c.voice_id,
                        gender: c.gender,
                    },
                )
            })
            .collect();

        let audio_dir = self.chapter_audio_dir(chapter.document_id, chapter.position);
        let total = segments.len();
        let mut succeeded = 0usize;

        for (index, segment) in segments.iter().enumerate() {
            if segment.text.trim().is_empty() {
                self.commit_progress(chapter_id, index + 1, total).await?;
                continue;
            }

            let voice = resolve_segment_voice(segment.speaker, &traits, narrator_id);
            let destination = format!("{audio_dir}/segment_{index:04}.mp3");

            match timeout(
                self.config.external_call_timeout(),
                self.synthesis.synthesize(&segment.text, &voice, &destination),
            )
            .await
            {
                Ok(Ok(())) => {
                    if self.storage.exists(&destination).await? {
                        let mut updated = segment.clone();
                        updated.audio_path = Some(destination);
                        self.library.put_segment(&updated).await?;
                        succeeded += 1;
                    } else {
                        warn!("synthesis reported success but left no artifact at {destination}");
                    }
                }
                Ok(Err(e)) => {
                    warn!("synthesis failed for segment {} with voice {voice}: {e:#}", segment.id);
                }
                Err(_) => {
                    warn!("synthesis timed out for segment {}", segment.id);
                }
            }

            self.commit_progress(chapter_id, index + 1, total).await?;
        }

        let Some(mut chapter) = self.library.chapter(chapter_id).await? else {
            return Err(anyhow!("chapter {chapter_id} disappeared during generation"));
        };
        if succeeded > 0 {
            advance_chapter(&mut chapter, ChapterStatus::Completed);
            chapter.progress = 100;
            chapter.audio_dir = Some(audio_dir);
            info!("generated audio for chapter {chapter_id}: {succeeded}/{total} segments");
        } else {
            advance_chapter(&mut chapter, ChapterStatus::Failed);
            chapter.progress = 0;
            chapter.audio_dir = None;
            warn!("audio generation failed for chapter {chapter_id}: no segment produced audio");
        }
        self.library.put_chapter(&chapter).await?;
        Ok(())
    }

    /// Full chain for one document: Parse → Analyze, then Segment → Generate
    /// per chapter with bounded cross-chapter concurrency.
    pub async fn process_document(&self, document_id: Id) -> Result<()> {
        self.parse(document_id).await?;

        let Some(document) = self.library.document(document_id).await? else {
            return Err(anyhow!("document {document_id} not found"));
        };
        if document.status == DocumentStatus::Failed {
            return Ok(());
        }

        self.analyze(document_id).await?;

        let chapters = self.library.chapters_by_document(document_id).await?;
        futures_util::stream::iter(chapters)
            .map(|chapter| async move {
                if let Err(e) = self.segment(chapter.id).await {
                    warn!("segment stage failed for chapter {}: {e:#}", chapter.id);
                    return;
                }
                if let Err(e) = self.generate(chapter.id).await {
                    warn!("generate stage failed for chapter {}: {e:#}", chapter.id);
                }
            })
            .buffer_unordered(self.config.chapter_concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        Ok(())
    }

    /// Detaches a stage onto the runtime: the caller gets control back
    /// immediately and observes the result by re-reading entity status.
    pub fn spawn_stage(self: &Arc<Self>, stage: Stage, id: Id) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let result = match stage {
                Stage::Parse => pipeline.parse(id).await,
                Stage::Analyze => pipeline.analyze(id).await,
                Stage::Segment => pipeline.segment(id).await,
                Stage::Generate => pipeline.generate(id).await,
            };
            if let Err(e) = result {
                warn!("{stage:?} stage for entity {id} failed: {e:#}");
            }
        });
    }

    /// Removes the document and everything derived from it, audio included.
    pub async fn delete_document(&self, document_id: Id) -> Result<()> {
        if let Some(document) = self.library.document(document_id).await? {
            if let Some(cover) = &document.cover_path {
                self.storage.delete(cover).await?;
            }
        }
        self.library.delete_document(document_id).await
    }

    fn chapter_audio_dir(&self, document_id: Id, position: u32) -> String {
        self.config
            .audio_folder()
            .join(format!("doc_{document_id}"))
            .join(format!("chapter_{position}"))
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn chapter_lock(&self, chapter_id: Id) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.chapter_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(chapter_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn commit_progress(&self, chapter_id: Id, done: usize, total: usize) -> Result<()> {
        if let Some(mut chapter) = self.library.chapter(chapter_id).await? {
            chapter.progress = ((done as f64 / total as f64) * 100.0).round() as u8;
            self.library.put_chapter(&chapter).await?;
        }
        Ok(())
    }

    async fn upsert_character(
        &self,
        document_id: Id,
        entry: RosterEntry,
        voice: String,
    ) -> Result<Character> {
        let existing = self.library.characters_by_document(document_id).await?;
        if let Some(mut character) = existing
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(&entry.name))
        {
            character.gender = entry.gender;
            character.age_category = entry.age_category;
            character.tone = entry.tone;
            character.voice_quality = entry.voice_quality;
            character.description = entry.description;
            character.voice_id = Some(voice);
            self.library.put_character(&character).await?;
            Ok(character)
        } else {
            self.library
                .insert_character(
                    document_id,
                    CharacterDraft {
                        name: entry.name,
                        gender: entry.gender,
                        age_category: entry.age_category,
                        tone: entry.tone,
                        voice_quality: entry.voice_quality,
                        description: entry.description,
                        voice_id: Some(voice),
                    },
                )
                .await
        }
    }

    async fn ensure_narrator(&self, document_id: Id) -> Result<()> {
        let characters = self.library.characters_by_document(document_id).await?;
        if characters
            .iter()
            .any(|c| c.name.trim().eq_ignore_ascii_case(NARRATOR_NAME))
        {
            return Ok(());
        }

        let voice = self.registry.find_best_match(
            Some("neutral"),
            Some("adult"),
            Some("warm"),
            Some("calm"),
            &self.config.locale,
        );
        self.library
            .insert_character(
                document_id,
                CharacterDraft {
                    name: NARRATOR_NAME.to_string(),
                    gender: "neutral".to_string(),
                    age_category: "adult".to_string(),
                    tone: "warm".to_string(),
                    voice_quality: "calm".to_string(),
                    description: "Standard narrator voice".to_string(),
                    voice_id: Some(voice),
                },
            )
            .await?;
        Ok(())
    }
}

fn advance_document(document: &mut Document, next: DocumentStatus) {
    if document.status.can_become(next) {
        document.status = next;
    } else {
        warn!(
            "document {} stays {:?}: transition to {next:?} is not legal",
            document.id, document.status
        );
    }
}

fn advance_chapter(chapter: &mut Chapter, next: ChapterStatus) {
    if chapter.status.can_become(next) {
        chapter.status = next;
    } else {
        warn!(
            "chapter {} stays {:?}: transition to {next:?} is not legal",
            chapter.id, chapter.status
        );
    }
}
