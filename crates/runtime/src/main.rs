//! `quill`: a small command-line surface over the conversational agent — an
//! interactive chat session by default, plus one-shot `generate`/`list`
//! subcommands for driving the content generator directly. Trimmed down
//! from the daemon/TUI/server surfaces this crate used to expose: a chat
//! API and a generation API, nothing resembling a chat client protocol or
//! a tool-calling loop, so neither does this binary.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use quill_agent::{AgentContext, ChatRequest};
use quill_memory::GenerationMode;

#[derive(Debug, Parser)]
#[command(name = "quill", version, about = "A conversational long-form fiction authoring engine")]
struct Cli {
    /// TOML config file; a missing file falls back to defaults.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
    /// Append-only JSONL memory log; omit to keep memory in-process only.
    #[arg(long)]
    memory_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat session (the default when no subcommand is given).
    Chat,
    /// Runs the Content Generator directly for a single chapter.
    Generate {
        project_id: String,
        chapter_number: u32,
        #[arg(long, value_enum, default_value = "full")]
        mode: CliGenerationMode,
        #[arg(long)]
        constraints: Option<String>,
    },
    /// Lists every generation record on file for a project.
    List { project_id: String },
}

/// Mirrors `quill_memory::GenerationMode` for `clap`'s sake; the domain enum
/// has no `ValueEnum` impl of its own since memory domain types stay free of
/// interface-layer concerns.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliGenerationMode {
    Full,
    Continue,
    Expand,
    Rewrite,
    Outline,
}

impl From<CliGenerationMode> for GenerationMode {
    fn from(mode: CliGenerationMode) -> Self {
        match mode {
            CliGenerationMode::Full => GenerationMode::Full,
            CliGenerationMode::Continue => GenerationMode::Continue,
            CliGenerationMode::Expand => GenerationMode::Expand,
            CliGenerationMode::Rewrite => GenerationMode::Rewrite,
            CliGenerationMode::Outline => GenerationMode::Outline,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    quill_runtime::init_tracing();

    let cli = Cli::parse();
    let config = quill_config::AppConfig::load_from(&cli.config)?;
    let context = quill_runtime::build_context(config, cli.memory_log.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat_session(&context).await,
        Commands::Generate { project_id, chapter_number, mode, constraints } => {
            let outcome = quill_agent::generate_chapter(&context, &project_id, chapter_number, mode.into(), constraints).await?;
            println!(
                "chapter {} ready ({} words, coalesced={})\n\n{}",
                outcome.record.chapter_number, outcome.record.word_count, outcome.coalesced, outcome.record.content
            );
            Ok(())
        }
        Commands::List { project_id } => {
            let records = quill_agent::list_generations(&context, &project_id).await?;
            for record in records {
                println!("chapter {:>3}  {:?}  {:?}  {} words", record.chapter_number, record.mode, record.state, record.word_count);
            }
            Ok(())
        }
    }
}

/// A plain stdin/stdout chat loop: the simplest possible surface over
/// `chat`, with no TTY/terminal-mode handling since that machinery belongs
/// to a richer front end this crate no longer ships.
async fn run_chat_session(context: &Arc<AgentContext>) -> Result<()> {
    println!("quill is listening. Describe your story, then say \"write chapter 1\" when you're ready. Ctrl-D to exit.");
    let session_id = uuid::Uuid::new_v4().to_string();
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = quill_agent::chat(
            context,
            ChatRequest { session_id: Some(session_id.clone()), message: line.to_string(), project_id: None },
        )
        .await;

        println!("{}", reply.reply_text);
        if let Some(generated) = reply.generated {
            println!("[chapter {} — {} words]", generated.chapter_number, generated.word_count);
        }
        if let Some(envelope) = reply.error {
            tracing::warn!(kind = ?envelope.kind, retryable = envelope.retryable, "turn completed with an error envelope");
        }
    }

    Ok(())
}
