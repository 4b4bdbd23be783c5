use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::llm::LlmConfig;
use crate::services::tts::SpeechGatewayConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Root for everything the pipeline persists: library rows, covers, audio.
    #[serde(default = "default_data")]
    pub data_folder: String,

    /// Locale used when matching voices to characters.
    #[serde(default = "default_locale")]
    pub locale: String,

    /// How many leading chapters feed the character analysis.
    #[serde(default = "default_analysis_chapters")]
    pub analysis_chapters: usize,

    /// Upper bound on any single LLM or TTS call, in seconds. Expiry counts as
    /// that stage's provider failure, never the whole pipeline's.
    #[serde(default = "default_call_timeout")]
    pub external_call_timeout_secs: u64,

    /// How many chapters may run Segment/Generate at once in the chained flow.
    #[serde(default = "default_concurrency")]
    pub chapter_concurrency: usize,

    pub llm: LlmConfig,

    #[serde(default)]
    pub audio: SpeechGatewayConfig,
}

fn default_data() -> String {
    "data".to_string()
}
fn default_locale() -> String {
    "fr-FR".to_string()
}
fn default_analysis_chapters() -> usize {
    3
}
fn default_call_timeout() -> u64 {
    60
}
fn default_concurrency() -> usize {
    2
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn library_folder(&self) -> PathBuf {
        Path::new(&self.data_folder).join("library")
    }

    pub fn covers_folder(&self) -> PathBuf {
        Path::new(&self.data_folder).join("covers")
    }

    pub fn audio_folder(&self) -> PathBuf {
        Path::new(&self.data_folder).join("audio")
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(self.library_folder())?;
        fs::create_dir_all(self.covers_folder())?;
        fs::create_dir_all(self.audio_folder())?;
        Ok(())
    }
}
