use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use epub::doc::EpubDoc;
use log::debug;

/// Chapters shorter than this are front matter, not content.
const MIN_CHAPTER_CHARS: usize = 100;
const TEXT_WRAP_WIDTH: usize = 200;

#[derive(Debug, Clone)]
pub struct ParsedChapter {
    pub position: u32,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub title: String,
    pub author: String,
    pub cover_path: Option<String>,
    pub chapters: Vec<ParsedChapter>,
}

/// Opaque parsed-document producer. Parsing is CPU-bound local work, so the
/// trait stays synchronous.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, source_path: &str) -> Result<ParsedDocument>;
}

pub struct EpubParser {
    covers_dir: PathBuf,
}

impl EpubParser {
    pub fn new(covers_dir: impl Into<PathBuf>) -> Self {
        Self {
            covers_dir: covers_dir.into(),
        }
    }

    fn save_cover(&self, source_path: &str, data: &[u8], mimetype: &str) -> Result<String> {
        let ext = match mimetype {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            _ => "img",
        };
        let stem = Path::new(source_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());

        fs::create_dir_all(&self.covers_dir)?;
        let cover_path = self.covers_dir.join(format!("{stem}_cover.{ext}"));
        fs::write(&cover_path, data)
            .with_context(|| format!("write cover {}", cover_path.display()))?;
        Ok(cover_path.to_string_lossy().replace('\\', "/"))
    }
}

impl DocumentParser for EpubParser {
    fn parse(&self, source_path: &str) -> Result<ParsedDocument> {
        let mut doc = EpubDoc::new(source_path)
            .map_err(|e| anyhow!("Failed to read EPUB {source_path}: {e}"))?;

        let title = doc
            .mdata("title")
            .map(|m| m.value.clone())
            .unwrap_or_else(|| "Unknown Title".to_string());
        let author = doc
            .mdata("creator")
            .map(|m| m.value.clone())
            .unwrap_or_else(|| "Unknown Author".to_string());

        let cover_path = match doc.get_cover() {
            Some((data, mimetype)) => Some(self.save_cover(source_path, &data, &mimetype)?),
            None => None,
        };

        let mut chapters = Vec::new();
        let mut position = 1u32;
        loop {
            let Some((content, mimetype)) = doc.get_current_str() else {
                if !doc.go_next() {
                    break;
                }
                continue;
            };

            if matches!(mimetype.as_str(), "application/xhtml+xml" | "text/html") {
                let text = html2text::from_read(content.as_bytes(), TEXT_WRAP_WIDTH)
                    .map_err(|e| anyhow!("Failed to render chapter html: {e}"))?;
                let text = tidy_text(&text);

                if text.chars().count() > MIN_CHAPTER_CHARS {
                    chapters.push(ParsedChapter {
                        position,
                        title: chapter_title(&text, position),
                        text,
                    });
                    position += 1;
                } else {
                    debug!("skipping short spine item in {source_path}");
                }
            }

            if !doc.go_next() {
                break;
            }
        }

        Ok(ParsedDocument {
            title,
            author,
            cover_path,
            chapters,
        })
    }
}

/// Collapses blank runs and trims every line.
fn tidy_text(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n")
}

/// First heading-ish line of the chapter, else "Chapter {n}".
fn chapter_title(text: &str, position: u32) -> String {
    let first = text
        .lines()
        .map(|l| l.trim_start_matches('#').trim())
        .find(|l| !l.is_empty());
    match first {
        Some(line) if line.chars().count() <= 120 => line.to_string(),
        _ => format!("Chapter {position}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_come_from_the_first_heading_line() {
        let text = "# The Boy Who Lived\n\nMr and Mrs Dursley were proud to say...";
        assert_eq!(chapter_title(text, 1), "The Boy Who Lived");
    }

    #[test]
    fn overlong_first_lines_fall_back_to_numbering() {
        let text = "a".repeat(200);
        assert_eq!(chapter_title(&text, 3), "Chapter 3");
    }

    #[test]
    fn tidy_collapses_blank_runs() {
        let raw = "  one  \n\n\n\ntwo\n\n";
        assert_eq!(tidy_text(raw), "one\n\ntwo");
    }
}
