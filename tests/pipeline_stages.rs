use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use bookcast::core::config::Config;
use bookcast::core::io::{NativeStorage, Storage};
use bookcast::core::library::{JsonLibrary, Library};
use bookcast::core::model::{
    ChapterStatus, CharacterDraft, DocumentStatus, Id, SegmentDraft, Speaker,
};
use bookcast::services::analysis::{AnalysisProvider, RawSegment, RosterEntry, SpeakerRef};
use bookcast::services::llm::LlmConfig;
use bookcast::services::parser::{DocumentParser, ParsedChapter, ParsedDocument};
use bookcast::services::pipeline::{Pipeline, Stage};
use bookcast::services::tts::{SynthesisProvider, Voice};

// --- Mock collaborators ---

struct MockParser {
    fail: bool,
    chapters: Vec<(&'static str, &'static str)>,
}

impl MockParser {
    fn with_chapters(chapters: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            fail: false,
            chapters,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            chapters: Vec::new(),
        }
    }
}

impl DocumentParser for MockParser {
    fn parse(&self, _source_path: &str) -> Result<ParsedDocument> {
        if self.fail {
            return Err(anyhow!("unreadable source"));
        }
        Ok(ParsedDocument {
            title: "A Test Book".to_string(),
            author: "A. Writer".to_string(),
            cover_path: None,
            chapters: self
                .chapters
                .iter()
                .enumerate()
                .map(|(i, (title, text))| ParsedChapter {
                    position: (i + 1) as u32,
                    title: title.to_string(),
                    text: text.to_string(),
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct MockAnalysis {
    roster: Vec<RosterEntry>,
    roles: Vec<RawSegment>,
    fail_analyze: bool,
    fail_roles: bool,
    roles_calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl AnalysisProvider for MockAnalysis {
    async fn analyze_roster(&self, _text: &str) -> Result<Vec<RosterEntry>> {
        if self.fail_analyze {
            return Err(anyhow!("analysis backend down"));
        }
        Ok(self.roster.clone())
    }

    async fn assign_roles(&self, _text: &str, _roster: &[SpeakerRef]) -> Result<Vec<RawSegment>> {
        *self.roles_calls.lock().unwrap() += 1;
        if self.fail_roles {
            return Err(anyhow!("role assignment backend down"));
        }
        Ok(self.roles.clone())
    }
}

struct MockSynthesis {
    storage: Arc<dyn Storage>,
    fail_all: bool,
    fail_indices: HashSet<usize>,
    calls: Arc<Mutex<usize>>,
    voices_used: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesis {
    fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            fail_all: false,
            fail_indices: HashSet::new(),
            calls: Arc::new(Mutex::new(0)),
            voices_used: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl SynthesisProvider for MockSynthesis {
    async fn list_voices(&self) -> Result<Vec<Voice>> {
        Ok(Vec::new())
    }

    async fn synthesize(&self, _text: &str, voice_id: &str, destination: &str) -> Result<()> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let index = *calls;
            *calls += 1;
            index
        };
        self.voices_used.lock().unwrap().push(voice_id.to_string());
        if self.fail_all || self.fail_indices.contains(&index) {
            return Err(anyhow!("synthesis backend failure"));
        }
        self.storage.write(destination, b"mp3 bytes").await
    }
}

// --- Test rig ---

struct Rig {
    _tmp: tempfile::TempDir,
    storage: Arc<dyn Storage>,
    library: Arc<dyn Library>,
    config: Config,
}

async fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        data_folder: tmp.path().join("data").to_string_lossy().to_string(),
        locale: "fr-FR".to_string(),
        analysis_chapters: 3,
        external_call_timeout_secs: 5,
        chapter_concurrency: 2,
        llm: LlmConfig {
            provider: "mock".to_string(),
            gemini: None,
            openai: None,
        },
        audio: Default::default(),
    };
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let library: Arc<dyn Library> = Arc::new(
        JsonLibrary::open(config.library_folder(), storage.clone())
            .await
            .unwrap(),
    );
    Rig {
        _tmp: tmp,
        storage,
        library,
        config,
    }
}

impl Rig {
    fn pipeline(
        &self,
        parser: MockParser,
        analysis: MockAnalysis,
        synthesis: MockSynthesis,
    ) -> Pipeline {
        Pipeline::new(
            self.config.clone(),
            self.library.clone(),
            self.storage.clone(),
            Box::new(parser),
            Box::new(analysis),
            Box::new(synthesis),
        )
    }

    async fn seed_document(&self) -> Id {
        self.library
            .create_document("seed", "seed", "seed.epub")
            .await
            .unwrap()
            .id
    }
}

fn entry(name: &str, gender: &str) -> RosterEntry {
    RosterEntry {
        name: name.to_string(),
        gender: gender.to_string(),
        age_category: "adult".to_string(),
        tone: "neutral".to_string(),
        voice_quality: "calm".to_string(),
        description: String::new(),
    }
}

fn raw(text: &str, speaker: &str) -> RawSegment {
    RawSegment {
        text: Some(text.to_string()),
        speaker: Some(speaker.to_string()),
    }
}

fn character(name: &str, gender: &str) -> CharacterDraft {
    CharacterDraft {
        name: name.to_string(),
        gender: gender.to_string(),
        age_category: "adult".to_string(),
        tone: "neutral".to_string(),
        voice_quality: "calm".to_string(),
        description: String::new(),
        voice_id: None,
    }
}

// --- Parse ---

#[tokio::test]
async fn parse_failure_marks_document_failed_with_no_chapters() {
    let rig = rig().await;
    let pipeline = rig.pipeline(
        MockParser::failing(),
        MockAnalysis::default(),
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("bad.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();

    let document = rig.library.document(document.id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Failed);
    assert!(rig
        .library
        .chapters_by_document(document.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reparsing_does_not_duplicate_chapters() {
    let rig = rig().await;
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "first text"), ("Two", "second text")]),
        MockAnalysis::default(),
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    pipeline.parse(document.id).await.unwrap();

    let chapters = rig.library.chapters_by_document(document.id).await.unwrap();
    assert_eq!(chapters.len(), 2);
    let positions: Vec<u32> = chapters.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![1, 2]);
    assert_eq!(chapters[0].status, ChapterStatus::Pending);

    let document = rig.library.document(document.id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);
    assert_eq!(document.title, "A Test Book");
}

// --- Analyze ---

#[tokio::test]
async fn analyze_assigns_voices_and_synthesizes_a_narrator() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        roster: vec![entry("Harry", "male")],
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    pipeline.analyze(document.id).await.unwrap();

    let characters = rig
        .library
        .characters_by_document(document.id)
        .await
        .unwrap();
    assert_eq!(characters.len(), 2);
    let harry = characters.iter().find(|c| c.name == "Harry").unwrap();
    assert!(harry.voice_id.as_deref().is_some_and(|v| !v.is_empty()));
    let narrator = characters.iter().find(|c| c.name == "Narrator").unwrap();
    assert_eq!(narrator.voice_id.as_deref(), Some("fr-FR-DeniseNeural"));

    let document = rig.library.document(document.id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);
}

#[tokio::test]
async fn analyze_absorbs_provider_failure() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        fail_analyze: true,
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    pipeline.analyze(document.id).await.unwrap();

    // The provider fell over, yet the document is Ready and the narrator exists.
    let characters = rig
        .library
        .characters_by_document(document.id)
        .await
        .unwrap();
    assert_eq!(characters.len(), 1);
    assert_eq!(characters[0].name, "Narrator");
    let document = rig.library.document(document.id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);
}

#[tokio::test]
async fn analyze_without_chapters_touches_nothing() {
    let rig = rig().await;
    let pipeline = rig.pipeline(
        MockParser::failing(),
        MockAnalysis {
            roster: vec![entry("Ghost", "male")],
            ..Default::default()
        },
        MockSynthesis::new(rig.storage.clone()),
    );

    let document_id = rig.seed_document().await;
    pipeline.analyze(document_id).await.unwrap();

    assert!(rig
        .library
        .characters_by_document(document_id)
        .await
        .unwrap()
        .is_empty());
    let document = rig.library.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Processing);
}

#[tokio::test]
async fn reanalyzing_does_not_duplicate_characters() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        roster: vec![entry("Harry", "male"), entry("hermione", "female")],
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    pipeline.analyze(document.id).await.unwrap();
    pipeline.analyze(document.id).await.unwrap();

    let characters = rig
        .library
        .characters_by_document(document.id)
        .await
        .unwrap();
    assert_eq!(characters.len(), 3, "two cast members plus the narrator");
}

// --- Segment ---

#[tokio::test]
async fn segment_is_idempotent_for_unchanged_provider_output() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        roles: vec![raw("It was dark.", "Narrator"), raw("Who's there?", "Harry")],
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "chapter text")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;
    rig.library
        .insert_character(document.id, character("Harry", "male"))
        .await
        .unwrap();

    pipeline.segment(chapter_id).await.unwrap();
    let first: Vec<(String, Speaker)> = rig
        .library
        .segments_by_chapter(chapter_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.text, s.speaker))
        .collect();

    pipeline.segment(chapter_id).await.unwrap();
    let second: Vec<(String, Speaker)> = rig
        .library
        .segments_by_chapter(chapter_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.text, s.speaker))
        .collect();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);

    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Processing);
}

#[tokio::test]
async fn segment_falls_back_to_full_text_narrator_on_provider_failure() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        fail_roles: true,
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "the entire chapter text")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;

    pipeline.segment(chapter_id).await.unwrap();

    let segments = rig.library.segments_by_chapter(chapter_id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].text, "the entire chapter text");
    assert_eq!(segments[0].speaker, Speaker::Narrator);
}

// --- Generate ---

async fn seeded_chapter(rig: &Rig, pipeline: &Pipeline, texts: &[&str]) -> (Id, Id) {
    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;
    let drafts = texts
        .iter()
        .map(|text| SegmentDraft {
            text: text.to_string(),
            speaker: Speaker::Narrator,
        })
        .collect();
    rig.library.replace_segments(chapter_id, drafts).await.unwrap();
    (document.id, chapter_id)
}

#[tokio::test]
async fn generate_with_partial_failures_still_completes() {
    let rig = rig().await;
    let mut synthesis = MockSynthesis::new(rig.storage.clone());
    synthesis.fail_indices.insert(1);
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        MockAnalysis::default(),
        synthesis,
    );

    let (_document_id, chapter_id) =
        seeded_chapter(&rig, &pipeline, &["first", "second", "third"]).await;

    pipeline.generate(chapter_id).await.unwrap();

    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Completed);
    assert_eq!(chapter.progress, 100);
    assert!(chapter.audio_dir.is_some());

    let segments = rig.library.segments_by_chapter(chapter_id).await.unwrap();
    let artifacts = segments.iter().filter(|s| s.audio_path.is_some()).count();
    assert_eq!(artifacts, 2);
    assert!(segments[1].audio_path.is_none(), "failed segment keeps no artifact");
}

#[tokio::test]
async fn generate_with_all_failures_marks_chapter_failed() {
    let rig = rig().await;
    let mut synthesis = MockSynthesis::new(rig.storage.clone());
    synthesis.fail_all = true;
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        MockAnalysis::default(),
        synthesis,
    );

    let (_document_id, chapter_id) = seeded_chapter(&rig, &pipeline, &["first", "second"]).await;

    pipeline.generate(chapter_id).await.unwrap();

    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Failed);
    assert_eq!(chapter.progress, 0);
    assert!(chapter.audio_dir.is_none());
}

#[tokio::test]
async fn generate_skips_empty_segments_without_counting_them_as_failures() {
    let rig = rig().await;
    let synthesis = MockSynthesis::new(rig.storage.clone());
    let calls = synthesis.calls.clone();
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "text")]),
        MockAnalysis::default(),
        synthesis,
    );

    let (_document_id, chapter_id) = seeded_chapter(&rig, &pipeline, &["   ", "spoken"]).await;

    pipeline.generate(chapter_id).await.unwrap();

    assert_eq!(*calls.lock().unwrap(), 1, "blank segment never reaches the synthesizer");
    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Completed);
    assert_eq!(chapter.progress, 100);
}

#[tokio::test]
async fn generate_synthesizes_a_fallback_segment_when_none_exist() {
    let rig = rig().await;
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "lonely chapter text")]),
        MockAnalysis::default(),
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;

    pipeline.generate(chapter_id).await.unwrap();

    let segments = rig.library.segments_by_chapter(chapter_id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].text, "lonely chapter text");
    assert!(segments[0].audio_path.is_some());
    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Completed);
}

// --- End to end ---

#[tokio::test]
async fn cast_scenario_resolves_voices_per_speaker() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        roles: vec![raw("It was dark.", "Narrator"), raw("Who's there?", "Harry")],
        ..Default::default()
    };
    let synthesis = MockSynthesis::new(rig.storage.clone());
    let voices_used = synthesis.voices_used.clone();
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "It was dark. \"Who's there?\"")]),
        analysis,
        synthesis,
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;
    // Neither character carries an assigned voice: resolution falls through to
    // the gender defaults.
    let harry = rig
        .library
        .insert_character(document.id, character("Harry", "male"))
        .await
        .unwrap();
    rig.library
        .insert_character(document.id, character("Narrator", "neutral"))
        .await
        .unwrap();

    pipeline.segment(chapter_id).await.unwrap();
    let segments = rig.library.segments_by_chapter(chapter_id).await.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].speaker, Speaker::Narrator);
    assert_eq!(segments[1].speaker, Speaker::Character(harry.id));

    pipeline.generate(chapter_id).await.unwrap();

    assert_eq!(
        *voices_used.lock().unwrap(),
        vec!["fr-FR-DeniseNeural".to_string(), "fr-FR-HenriNeural".to_string()]
    );

    let chapter = rig.library.chapter(chapter_id).await.unwrap().unwrap();
    assert_eq!(chapter.status, ChapterStatus::Completed);
    assert_eq!(chapter.progress, 100);

    let segments = rig.library.segments_by_chapter(chapter_id).await.unwrap();
    assert!(segments.iter().all(|s| s.audio_path.is_some()));
    assert!(segments[0]
        .audio_path
        .as_deref()
        .unwrap()
        .ends_with("segment_0000.mp3"));
    assert!(segments[1]
        .audio_path
        .as_deref()
        .unwrap()
        .ends_with("segment_0001.mp3"));
}

#[tokio::test]
async fn process_document_chains_every_stage() {
    let rig = rig().await;
    let analysis = MockAnalysis {
        roster: vec![entry("Ana", "female")],
        roles: vec![raw("Once upon a time.", "Narrator")],
        ..Default::default()
    };
    let pipeline = rig.pipeline(
        MockParser::with_chapters(vec![("One", "first"), ("Two", "second")]),
        analysis,
        MockSynthesis::new(rig.storage.clone()),
    );

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.process_document(document.id).await.unwrap();

    let document = rig.library.document(document.id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);

    let chapters = rig.library.chapters_by_document(document.id).await.unwrap();
    assert_eq!(chapters.len(), 2);
    for chapter in &chapters {
        assert_eq!(chapter.status, ChapterStatus::Completed);
        assert_eq!(chapter.progress, 100);
        assert!(chapter.audio_dir.is_some());
    }
}

#[tokio::test]
async fn spawned_stages_are_observable_by_polling() {
    let rig = rig().await;
    let pipeline = Arc::new(rig.pipeline(
        MockParser::with_chapters(vec![("One", "text to read aloud")]),
        MockAnalysis::default(),
        MockSynthesis::new(rig.storage.clone()),
    ));

    let document = pipeline.register_document("book.epub").await.unwrap();
    pipeline.parse(document.id).await.unwrap();
    let chapter_id = rig.library.chapters_by_document(document.id).await.unwrap()[0].id;

    pipeline.spawn_stage(Stage::Generate, chapter_id);

    let mut status = ChapterStatus::Pending;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = rig
            .library
            .chapter(chapter_id)
            .await
            .unwrap()
            .unwrap()
            .status;
        if status == ChapterStatus::Completed {
            break;
        }
    }
    assert_eq!(status, ChapterStatus::Completed);
}
