use std::{io::Write, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use common::{storage::types::document::DocStatus, utils::config::get_config};
use futures::StreamExt;
use graphrag::RagEngine;
use retrieval_pipeline::{
    graph::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_NODES, DEFAULT_SEARCH_LIMIT},
    QueryMode, QueryParam, QueryResponse,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Knowledge-graph retrieval over your documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue text or files for ingestion
    Insert(InsertArgs),
    /// Process every pending document
    Process {
        /// Restrict the run to one track id
        #[arg(long)]
        track_id: Option<String>,
    },
    /// Answer a question
    Query(QueryArgs),
    /// Print the retrieved context as JSON without generating an answer
    QueryData(QueryArgs),
    /// Remove a document and everything derived only from it
    Delete { doc_id: String },
    /// Print the subgraph around an entity, or `*` for the whole graph
    Graph {
        label: String,
        #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
        max_depth: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_NODES)]
        max_nodes: usize,
    },
    /// List entity names
    Labels,
    /// Search entities by name or description
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// List documents, newest first
    Docs {
        /// pending, processing, preprocessed, processed or failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Document counts per status and the pipeline progress
    Status,
    /// Storage, model and graph summary
    Health,
    /// Delete every document in the workspace
    Clear,
}

#[derive(Args, Debug)]
struct InsertArgs {
    /// Files to enqueue (.txt, .md or .csv)
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Raw text to enqueue
    #[arg(long)]
    text: Option<String>,

    /// Source path recorded for `--text`
    #[arg(long)]
    file_path: Option<String>,

    #[arg(long)]
    track_id: Option<String>,

    /// Process the queue right after enqueueing
    #[arg(long)]
    process: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    query: String,

    #[arg(long, value_enum, default_value_t = QueryMode::Mix)]
    mode: QueryMode,

    /// Print answer fragments as they arrive
    #[arg(long)]
    stream: bool,

    #[arg(long)]
    only_context: bool,

    #[arg(long)]
    only_prompt: bool,

    /// Continue with the sources that answered when one fails
    #[arg(long)]
    allow_partial: bool,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    chunk_top_k: Option<usize>,

    #[arg(long)]
    max_total_tokens: Option<usize>,

    #[arg(long)]
    response_type: Option<String>,

    /// Extra instructions appended to the answer prompt
    #[arg(long)]
    user_prompt: Option<String>,

    /// Comma separated high-level keywords; skips keyword extraction
    #[arg(long, value_delimiter = ',')]
    hl_keywords: Vec<String>,

    /// Comma separated low-level keywords; skips keyword extraction
    #[arg(long, value_delimiter = ',')]
    ll_keywords: Vec<String>,

    #[arg(long = "no-rerank", action = clap::ArgAction::SetFalse)]
    rerank: bool,
}

impl QueryArgs {
    fn apply(&self, mut param: QueryParam) -> QueryParam {
        param.mode = self.mode;
        param.stream = self.stream;
        param.only_need_context = self.only_context;
        param.only_need_prompt = self.only_prompt;
        param.allow_partial = self.allow_partial;
        if let Some(top_k) = self.top_k {
            param.top_k_entities = top_k;
            param.top_k_relations = top_k;
        }
        if let Some(chunk_top_k) = self.chunk_top_k {
            param.chunk_top_k = chunk_top_k;
        }
        if let Some(max_total_tokens) = self.max_total_tokens {
            param.max_total_tokens = max_total_tokens;
        }
        if let Some(response_type) = &self.response_type {
            param.response_type.clone_from(response_type);
        }
        param.user_prompt.clone_from(&self.user_prompt);
        param.hl_keywords.clone_from(&self.hl_keywords);
        param.ll_keywords.clone_from(&self.ll_keywords);
        param.enable_rerank = param.enable_rerank && self.rerank;
        param
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;
    let engine = RagEngine::from_config(config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Command::Insert(args) => {
            let mut results = Vec::new();
            if let Some(text) = &args.text {
                results.push(
                    engine
                        .enqueue(text, args.file_path.as_deref(), args.track_id.as_deref())
                        .await?,
                );
            }
            for file in &args.files {
                results.push(engine.insert_file(file, args.track_id.as_deref()).await?);
            }
            print_json(&results)?;
            if args.process {
                let report = engine.process_pending(args.track_id.as_deref(), &cancel).await?;
                print_json(&report)?;
            }
        }
        Command::Process { track_id } => {
            let report = engine.process_pending(track_id.as_deref(), &cancel).await?;
            print_json(&report)?;
        }
        Command::Query(args) => {
            let param = args.apply(engine.default_query_param());
            match engine.query(&args.query, &param).await? {
                QueryResponse::Answer(text)
                | QueryResponse::Context(text)
                | QueryResponse::Prompt(text) => println!("{text}"),
                QueryResponse::Stream(mut stream) => {
                    let mut stdout = std::io::stdout();
                    while let Some(fragment) = stream.next().await {
                        if cancel.is_cancelled() {
                            break;
                        }
                        write!(stdout, "{}", fragment?)?;
                        stdout.flush()?;
                    }
                    writeln!(stdout)?;
                }
            }
        }
        Command::QueryData(args) => {
            let param = args.apply(engine.default_query_param());
            print_json(&engine.query_data(&args.query, &param).await?)?;
        }
        Command::Delete { doc_id } => {
            print_json(&engine.delete_document(&doc_id).await)?;
        }
        Command::Graph {
            label,
            max_depth,
            max_nodes,
        } => {
            print_json(&engine.knowledge_graph(&label, max_depth, max_nodes).await?)?;
        }
        Command::Labels => print_json(&engine.graph_labels().await?)?,
        Command::Search { query, limit } => {
            print_json(&engine.search_entities(&query, limit).await?)?;
        }
        Command::Docs { status } => {
            let status = status.as_deref().map(str::parse::<DocStatus>).transpose()?;
            print_json(&engine.list_documents(status).await?)?;
        }
        Command::Status => {
            print_json(&serde_json::json!({
                "documents": engine.status_counts().await?,
                "pipeline": engine.pipeline_status(),
            }))?;
        }
        Command::Health => print_json(&engine.health().await?)?,
        Command::Clear => print_json(&engine.clear_all().await?)?,
    }

    engine.finalize().await?;
    Ok(())
}
