//! # Chat Digest CLI (`chatdigest`)
//!
//! ## Usage
//!
//! ```bash
//! chatdigest --config ./config/chatdigest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatdigest check` | Probe the chat-log server, completion settings and Feishu credentials |
//! | `chatdigest digest <subject>` | Generate a structured digest and narrative report for one day |
//! | `chatdigest export <subject>` | Export a date range of messages into a new Feishu Bitable |
//! | `chatdigest chatrooms` | List group chats known to the chat-log server |
//! | `chatdigest ask <subject>` | Run a custom prompt over a date range of messages |

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use chat_digest::cancel::CancelToken;
use chat_digest::chatlog::{self, ChatlogClient};
use chat_digest::completion::OpenAiCompletionClient;
use chat_digest::config::{self, Config};
use chat_digest::digest::{self, AskRequest, DigestSubject, DigestSynthesizer};
use chat_digest::error::{PipelineError, Stage};
use chat_digest::export::{ExportCoordinator, ExportOptions, ExportRequest, DEFAULT_TABLE_NAME};
use chat_digest::feishu::FeishuClient;
use chat_digest::logging;
use chat_digest::progress::ProgressMode;
use chat_digest::sources;
use chat_digest::traits::{ChatSource, CompletionClient};
use chat_digest_core::models::SubjectKind;
use chat_digest_core::normalize::Normalizer;

/// Chat Digest CLI: daily AI digests and Bitable exports for chat logs.
#[derive(Parser)]
#[command(
    name = "chatdigest",
    about = "Chat Digest: daily AI digests and Feishu Bitable exports for chat logs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chatdigest.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check connectivity to every configured service.
    Check,

    /// Generate a digest for one subject and day.
    ///
    /// Prints the narrative report, or the full report as JSON with `--json`.
    Digest {
        /// Chat-log talker id (group `...@chatroom` or contact id).
        subject: String,

        /// Display name of the chat.
        #[arg(long)]
        name: Option<String>,

        /// Day to digest (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// `group` or `direct`. Inferred from the sender set when omitted.
        #[arg(long)]
        kind: Option<SubjectKind>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export messages into a new Bitable.
    ///
    /// Ctrl-C stops the export at the next batch boundary, or mid-batch before
    /// anything from that batch is written.
    Export {
        /// Chat-log talker id.
        subject: String,

        /// Display name of the chat, written into every row.
        #[arg(long)]
        name: Option<String>,

        /// First day (YYYY-MM-DD).
        #[arg(long)]
        from: String,

        /// Last day, inclusive (YYYY-MM-DD). Defaults to `--from`.
        #[arg(long)]
        to: Option<String>,

        /// Name of the table inside the new base.
        #[arg(long, default_value = DEFAULT_TABLE_NAME)]
        table_name: String,

        /// Skip AI classification; every row gets default labels.
        #[arg(long)]
        no_ai: bool,
    },

    /// List group chats that can be used as a subject.
    Chatrooms {
        /// Print the list as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a custom prompt from the messages of a date range.
    Ask {
        /// Chat-log talker id.
        subject: String,

        /// Display name of the chat.
        #[arg(long)]
        name: Option<String>,

        /// First day (YYYY-MM-DD).
        #[arg(long)]
        from: String,

        /// Last day, inclusive (YYYY-MM-DD). Defaults to `--from`.
        #[arg(long)]
        to: Option<String>,

        /// What to ask about the conversation.
        #[arg(long)]
        prompt: String,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
}

fn parse_range(from: &str, to: Option<&str>) -> Result<(NaiveDate, NaiveDate)> {
    let from = parse_date(from)?;
    let to = match to {
        Some(to) => parse_date(to)?,
        None => from,
    };
    Ok((from, to))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Check => {
            sources::run_check(&cfg).await?;
        }
        Commands::Digest {
            subject,
            name,
            date,
            kind,
            json,
        } => {
            let date = parse_date(&date)?;
            run_digest(&cfg, subject, name, date, kind, json).await?;
        }
        Commands::Export {
            subject,
            name,
            from,
            to,
            table_name,
            no_ai,
        } => {
            let (from, to) = parse_range(&from, to.as_deref())?;
            run_export(&cfg, progress, subject, name, from, to, table_name, no_ai).await?;
        }
        Commands::Chatrooms { json } => {
            run_chatrooms(&cfg, json).await?;
        }
        Commands::Ask {
            subject,
            name,
            from,
            to,
            prompt,
        } => {
            let (from, to) = parse_range(&from, to.as_deref())?;
            run_ask(&cfg, subject, name, from, to, prompt).await?;
        }
    }

    Ok(())
}

async fn run_digest(
    cfg: &Config,
    subject: String,
    name: Option<String>,
    date: NaiveDate,
    kind: Option<SubjectKind>,
    json: bool,
) -> Result<()> {
    let source = ChatlogClient::new(&cfg.chatlog)?;
    let completion: Arc<dyn CompletionClient> = Arc::new(OpenAiCompletionClient::new(&cfg.completion)?);

    let raw = source
        .fetch_messages(&subject, date)
        .await
        .map_err(|e| PipelineError::new(Stage::FetchMessages, e))?;
    let normalizer = Normalizer::with_offset_minutes(cfg.chatlog.utc_offset_minutes);
    let messages = normalizer.normalize(&raw);
    tracing::info!(raw = raw.len(), normalized = messages.len(), "Messages normalized");

    let subject = DigestSubject {
        name: name.unwrap_or_else(|| subject.clone()),
        id: subject,
        date,
        kind,
    };
    let report = DigestSynthesizer::new(completion)
        .generate_report(&messages, &subject)
        .await;

    if json {
        println!("{}", digest::report_json(&report)?);
    } else {
        println!("{}", report.text_report);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_export(
    cfg: &Config,
    progress: ProgressMode,
    subject: String,
    name: Option<String>,
    from: NaiveDate,
    to: NaiveDate,
    table_name: String,
    no_ai: bool,
) -> Result<()> {
    let source: Arc<dyn ChatSource> = Arc::new(ChatlogClient::new(&cfg.chatlog)?);
    let store = Arc::new(FeishuClient::new(&cfg.feishu)?);
    store
        .check_credentials()
        .await
        .map_err(|e| PipelineError::new(Stage::Auth, e))?;

    let mut options = ExportOptions::from(&cfg.export);
    options.classify &= !no_ai;
    let completion: Option<Arc<dyn CompletionClient>> = if options.classify {
        Some(Arc::new(OpenAiCompletionClient::new(&cfg.completion)?))
    } else {
        None
    };

    let raw = chatlog::fetch_range(source.as_ref(), &subject, from, to)
        .await
        .map_err(|e| PipelineError::new(Stage::FetchMessages, e))?;
    let messages = Normalizer::with_offset_minutes(cfg.chatlog.utc_offset_minutes).normalize(&raw);
    tracing::info!(raw = raw.len(), normalized = messages.len(), "Messages normalized");

    let chat_name = name.unwrap_or_else(|| subject.clone());
    let base_name = if from == to {
        format!("{} {}", chat_name, from)
    } else {
        format!("{} {} - {}", chat_name, from, to)
    };
    let request = ExportRequest {
        chat_name,
        base_name,
        table_name,
        fallback_date: Some(from),
    };

    let cancel = CancelToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current batch");
            on_ctrl_c.cancel();
        }
    });

    let coordinator = ExportCoordinator::new(source, store, completion, options)
        .with_reporter(Arc::from(progress.reporter()));
    let summary = coordinator.run(messages, &request, &cancel).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_chatrooms(cfg: &Config, json: bool) -> Result<()> {
    let rooms = ChatlogClient::new(&cfg.chatlog)?.list_chatrooms().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rooms)?);
        return Ok(());
    }
    println!("{:<40} NAME", "ID");
    for room in &rooms {
        println!("{:<40} {}", room.id, room.display_name);
    }
    eprintln!("{} chat room(s)", rooms.len());
    Ok(())
}

async fn run_ask(
    cfg: &Config,
    subject: String,
    name: Option<String>,
    from: NaiveDate,
    to: NaiveDate,
    prompt: String,
) -> Result<()> {
    let source = ChatlogClient::new(&cfg.chatlog)?;
    let completion: Arc<dyn CompletionClient> = Arc::new(OpenAiCompletionClient::new(&cfg.completion)?);

    let raw = chatlog::fetch_range(&source, &subject, from, to)
        .await
        .map_err(|e| PipelineError::new(Stage::FetchMessages, e))?;
    let messages = Normalizer::with_offset_minutes(cfg.chatlog.utc_offset_minutes).normalize(&raw);

    let request = AskRequest {
        prompt,
        subject_name: name.unwrap_or_else(|| subject.clone()),
        from,
        to,
    };
    let answer = DigestSynthesizer::new(completion)
        .ask(&messages, &request)
        .await
        .context("Custom prompt failed")?;
    println!("{}", answer);
    Ok(())
}
