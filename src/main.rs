use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;

use bookcast::core::config::Config;
use bookcast::core::io::{NativeStorage, Storage};
use bookcast::core::library::{JsonLibrary, Library};
use bookcast::core::model::DocumentStatus;
use bookcast::services::analysis::LlmAnalysisProvider;
use bookcast::services::llm::create_llm;
use bookcast::services::parser::EpubParser;
use bookcast::services::pipeline::Pipeline;
use bookcast::services::tts::EdgeGatewayClient;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let source = std::env::args()
        .nth(1)
        .context("usage: bookcast <book.epub>")?;

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let library: Arc<dyn Library> = Arc::new(
        JsonLibrary::open(config.library_folder(), storage.clone()).await?,
    );

    let llm = create_llm(&config.llm)?;
    let pipeline = Pipeline::new(
        config.clone(),
        library.clone(),
        storage.clone(),
        Box::new(EpubParser::new(config.covers_folder())),
        Box::new(LlmAnalysisProvider::new(llm)),
        Box::new(EdgeGatewayClient::new(config.audio.clone(), storage)),
    );

    let document = pipeline.register_document(&source).await?;
    pipeline.parse(document.id).await?;

    let parsed = library
        .document(document.id)
        .await?
        .context("document vanished after parse")?;
    if parsed.status == DocumentStatus::Failed {
        anyhow::bail!("could not parse {source}; see the log for details");
    }
    println!("{} by {}", parsed.title, parsed.author);

    pipeline.analyze(document.id).await?;

    let chapters = library.chapters_by_document(document.id).await?;
    let pb = ProgressBar::new(chapters.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    for chapter in &chapters {
        if let Err(e) = pipeline.segment(chapter.id).await {
            warn!("segment stage failed for chapter {}: {e:#}", chapter.id);
            pb.inc(1);
            continue;
        }
        if let Err(e) = pipeline.generate(chapter.id).await {
            warn!("generate stage failed for chapter {}: {e:#}", chapter.id);
        }
        pb.inc(1);
    }
    pb.finish_with_message("audiobook build finished");

    for chapter in library.chapters_by_document(document.id).await? {
        println!(
            "{:>4}. {} — {:?} ({}%)",
            chapter.position, chapter.title, chapter.status, chapter.progress
        );
    }

    Ok(())
}
