use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::services::llm::LlmClient;

/// Character-analysis input cap; chapters past this many chars are cut off
/// before the provider sees them.
pub const ANALYSIS_TEXT_LIMIT: usize = 15_000;
/// Role-assignment input cap.
pub const ROLES_TEXT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    #[serde(default = "default_gender")]
    pub gender: String,
    #[serde(default = "default_age")]
    pub age_category: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_quality")]
    pub voice_quality: String,
    #[serde(default)]
    pub description: String,
}

fn default_gender() -> String {
    "neutral".to_string()
}
fn default_age() -> String {
    "adult".to_string()
}
fn default_tone() -> String {
    "neutral".to_string()
}
fn default_quality() -> String {
    "calm".to_string()
}

/// The slice of a character the role-assignment prompt needs.
#[derive(Debug, Clone)]
pub struct SpeakerRef {
    pub name: String,
    pub gender: String,
}

/// One entry of raw role-assignment output, before normalization. Either field
/// may be missing in provider output; the assigner decides what that means.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSegment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
}

/// Language-understanding capability the pipeline consumes. Both calls are
/// independently fallible; the orchestrator absorbs failures per stage.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze_roster(&self, text: &str) -> Result<Vec<RosterEntry>>;
    async fn assign_roles(&self, text: &str, roster: &[SpeakerRef]) -> Result<Vec<RawSegment>>;
}

pub struct LlmAnalysisProvider {
    llm: Box<dyn LlmClient>,
}

impl LlmAnalysisProvider {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl AnalysisProvider for LlmAnalysisProvider {
    async fn analyze_roster(&self, text: &str) -> Result<Vec<RosterEntry>> {
        let prompt = format!(
            "Analyze the following text from a book chapter.\n\
             Identify the Narrator (if distinct) and all unique characters who speak \
             or are mentioned significantly.\n\n\
             For each character, determine:\n\
             - Their likely age category: \"child\" (0-12), \"teen\" (13-19), \
             \"young\" (20-35), \"adult\" (36-60), or \"old\" (60+)\n\
             - Their voice tone (e.g., \"deep\", \"high\", \"soft\", \"rough\", \"warm\", \"cold\")\n\
             - Their voice quality (e.g., \"energetic\", \"calm\", \"ominous\", \
             \"cheerful\", \"authoritative\")\n\n\
             Return the result strictly as a JSON object with this structure:\n\
             {{\"characters\": [{{\"name\": \"Character Name\", \
             \"gender\": \"male\" or \"female\" or \"neutral\", \
             \"age_category\": \"...\", \"tone\": \"...\", \"voice_quality\": \"...\", \
             \"description\": \"Short description of personality and role\"}}]}}\n\n\
             Text to analyze:\n{}",
            truncate_chars(text, ANALYSIS_TEXT_LIMIT)
        );

        let response = self
            .llm
            .chat("You are an expert literary analyst. Return only valid JSON.", &prompt)
            .await?;
        decode_roster(&response)
    }

    async fn assign_roles(&self, text: &str, roster: &[SpeakerRef]) -> Result<Vec<RawSegment>> {
        let speakers = roster
            .iter()
            .map(|c| format!("{} ({})", c.name, c.gender))
            .collect::<Vec<_>>()
            .join(", ");

        let prompt = format!(
            "Your task is to split the text into segments and assign a speaker to each segment.\n\n\
             Available speakers: {speakers}, Narrator.\n\n\
             Rules:\n\
             1. Narrator speaks all descriptive text, action, and narration.\n\
             2. Character names speak their dialogue (text inside quotation marks).\n\
             3. Keep dialogue with its surrounding description if short.\n\
             4. Aim for segments of 50-500 words each. Never split mid-sentence.\n\
             5. Return ONLY a valid JSON array, no explanations or markdown.\n\n\
             Example output:\n\
             [{{\"text\": \"The door creaked open.\", \"speaker\": \"Narrator\"}}, \
             {{\"text\": \"Who's there?\", \"speaker\": \"John\"}}]\n\n\
             Text to process:\n{}",
            truncate_chars(text, ROLES_TEXT_LIMIT)
        );

        let response = self
            .llm
            .chat(
                "You are a scriptwriter adapting a novel for audiobook narration.",
                &prompt,
            )
            .await?;
        decode_role_output(&response)
    }
}

#[derive(Deserialize)]
struct RosterDocument {
    #[serde(default)]
    characters: Vec<RosterEntry>,
}

/// Providers sometimes return a bare object where an array was asked for;
/// wrap it instead of failing the stage.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<RawSegment>),
    One(RawSegment),
}

pub fn decode_roster(response: &str) -> Result<Vec<RosterEntry>> {
    let clean = strip_code_blocks(response);
    let decoded: RosterDocument =
        serde_json::from_str(&clean).with_context(|| format!("parse roster JSON: {clean}"))?;
    Ok(decoded.characters)
}

pub fn decode_role_output(response: &str) -> Result<Vec<RawSegment>> {
    let clean = strip_code_blocks(response);
    let decoded: OneOrMany = serde_json::from_str(&clean)
        .with_context(|| format!("parse role-assignment JSON: {clean}"))?;
    Ok(match decoded {
        OneOrMany::Many(segments) => segments,
        OneOrMany::One(segment) => vec![segment],
    })
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
