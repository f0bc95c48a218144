//! # EKP CLI (`ekp`)
//!
//! Ingests local text files into an in-process index and answers
//! questions over them.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ekp chunk <file>` | Show how a file would be chunked |
//! | `ekp search "<query>" --docs <path>` | Rank chunks for a query |
//! | `ekp ask "<question>" --docs <path>` | Answer one question |
//! | `ekp chat --docs <path>` | Interactive session with memory and cache |
//!
//! ## Examples
//!
//! ```bash
//! ekp chunk ./docs/handbook.md --max-chars 500
//! ekp search "报销流程" --docs ./docs --mode hybrid --config ./config/ekp.toml
//! ekp ask "年假有几天？" --docs ./docs --top-k 3 --config ./config/ekp.toml
//! RUST_LOG=debug ekp chat --docs ./docs --config ./config/ekp.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use ekp_rag::app::App;
use ekp_rag::config::{self, Config};
use ekp_rag::qa::{AskOutcome, AskRequest, QaAnswer};
use ekp_rag_core::chunk::{chunk_stats, chunk_text};
use ekp_rag_core::models::RetrievalMode;
use ekp_rag_core::retrieve::preview;

/// EKP: question answering over an enterprise knowledge base.
#[derive(Parser)]
#[command(name = "ekp", version, about = "Retrieval-augmented question answering over local documents")]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `[embedding].provider` (disabled, openai, ollama).
    #[arg(long, global = true)]
    embedding_provider: Option<String>,

    /// Override `[embedding].model`.
    #[arg(long, global = true)]
    embedding_model: Option<String>,

    /// Override `[embedding].dims`.
    #[arg(long, global = true)]
    embedding_dims: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a file into chunks and print size statistics.
    Chunk {
        file: PathBuf,

        /// Override `[chunking].max_chars`.
        #[arg(long)]
        max_chars: Option<usize>,

        /// Override `[chunking].overlap_chars`.
        #[arg(long)]
        overlap_chars: Option<usize>,
    },

    /// Ingest documents and print the chunks ranked for a query.
    Search {
        query: String,

        /// Files or directories to ingest (.txt, .md).
        #[arg(long, required = true, num_args = 1..)]
        docs: Vec<PathBuf>,

        /// Retrieval mode: `vector` (alias `semantic`) or `hybrid`.
        #[arg(long)]
        mode: Option<RetrievalMode>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ingest documents and answer one question.
    Ask {
        question: String,

        #[arg(long, required = true, num_args = 1..)]
        docs: Vec<PathBuf>,

        #[arg(long)]
        mode: Option<RetrievalMode>,

        #[arg(long)]
        top_k: Option<usize>,

        /// Identity used for rate limiting.
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Ingest documents and start an interactive session.
    ///
    /// Lines starting with `/` are commands: `/hot`, `/history`, `/clear`,
    /// `/exit`.
    Chat {
        #[arg(long, required = true, num_args = 1..)]
        docs: Vec<PathBuf>,

        #[arg(long)]
        mode: Option<RetrievalMode>,

        #[arg(long, default_value = "cli")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli)?;

    match cli.command {
        Commands::Chunk {
            file,
            max_chars,
            overlap_chars,
        } => run_chunk(&cfg, &file, max_chars, overlap_chars)?,
        Commands::Search {
            query,
            docs,
            mode,
            top_k,
        } => {
            let app = App::build(cfg)?;
            app.ingest_paths(&docs).await?;
            let mode = mode.unwrap_or(app.config.retrieval.mode);
            let top_k = top_k.unwrap_or(app.config.retrieval.top_k);
            let results = app.retriever.search(&query, top_k, mode, None).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({})",
                    i + 1,
                    r.score,
                    r.document_title.as_deref().unwrap_or(&r.document_id),
                    r.chunk_id
                );
                println!("    {}", preview(&r.content, 200).replace('\n', " "));
            }
        }
        Commands::Ask {
            question,
            docs,
            mode,
            top_k,
            user,
        } => {
            let app = App::build(cfg)?;
            app.ingest_paths(&docs).await?;
            let request = AskRequest {
                mode,
                top_k,
                ..AskRequest::new(user, question)
            };
            match app.qa.ask(request).await? {
                AskOutcome::Answered(answer) => print_answer(&answer),
                AskOutcome::RateLimited => println!("Rate limit exceeded, try again later."),
            }
        }
        Commands::Chat { docs, mode, user } => {
            let app = App::build(cfg)?;
            app.ingest_paths(&docs).await?;
            run_chat(&app, mode, &user).await?;
        }
    }

    Ok(())
}

fn load(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(provider) = &cli.embedding_provider {
        cfg.embedding.provider = provider.clone();
    }
    if let Some(model) = &cli.embedding_model {
        cfg.embedding.model = Some(model.clone());
    }
    if let Some(dims) = cli.embedding_dims {
        cfg.embedding.dims = Some(dims);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run_chunk(
    cfg: &Config,
    file: &Path,
    max_chars: Option<usize>,
    overlap_chars: Option<usize>,
) -> Result<()> {
    let doc = ekp_rag::ingest::read_text_file(file, None)?;
    let chunks = chunk_text(
        &doc.document_id,
        &doc.text,
        max_chars.unwrap_or(cfg.chunking.max_chars),
        overlap_chars.unwrap_or(cfg.chunking.overlap_chars),
    );
    let stats = chunk_stats(&chunks);

    println!("Document: {}", doc.document_id);
    println!("  chunks:      {}", stats.total_chunks);
    println!("  tokens:      {}", stats.total_tokens);
    println!(
        "  chunk size:  avg {} / min {} / max {}",
        stats.avg_chunk_size, stats.min_chunk_size, stats.max_chunk_size
    );
    for chunk in &chunks {
        println!(
            "\n#{} ({} tokens) {}",
            chunk.chunk_index, chunk.token_count, chunk.id
        );
        println!("  {}", preview(&chunk.content, 120).replace('\n', " "));
    }
    Ok(())
}

fn print_answer(answer: &QaAnswer) {
    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!("\nSources:");
        for (i, s) in answer.sources.iter().enumerate() {
            println!(
                "  [{}] {} ({:.3})",
                i + 1,
                s.document_title.as_deref().unwrap_or(&s.document_id),
                s.relevance_score
            );
        }
    }
    println!(
        "\n({}{}, {} ms)",
        answer.model_used.as_deref().unwrap_or("no model"),
        if answer.from_cache { ", cached" } else { "" },
        answer.response_time_ms
    );
}

async fn run_chat(app: &App, mode: Option<RetrievalMode>, user: &str) -> Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();
    println!("Session {}. Type /exit to quit.", session_id);

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/exit" | "/quit" => break,
            "/hot" => {
                for (i, hot) in app.qa.hot_questions(10).await?.iter().enumerate() {
                    println!("{}. ({}) {}", i + 1, hot.score, hot.question);
                }
            }
            "/history" => {
                for message in app.qa.memory().all_messages(&session_id).await? {
                    println!(
                        "[{}] {}: {}",
                        message.timestamp.format("%H:%M:%S"),
                        message.role,
                        preview(&message.content, 80)
                    );
                }
            }
            "/clear" => {
                app.qa.memory().clear(&session_id).await?;
                println!("History cleared.");
            }
            question => {
                let request = AskRequest {
                    mode,
                    session_id: Some(session_id.clone()),
                    ..AskRequest::new(user, question)
                };
                match app.qa.ask(request).await {
                    Ok(AskOutcome::Answered(answer)) => print_answer(&answer),
                    Ok(AskOutcome::RateLimited) => {
                        println!("Rate limit exceeded, try again later.")
                    }
                    Err(e) => println!("Error: {}", e),
                }
            }
        }
    }
    Ok(())
}
