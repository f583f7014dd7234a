use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use doc_retrieval_core::{
    CharacterNgramEmbedder, EmbeddingClient, ExtractorRegistry, IngestionPipeline,
    MetadataFilter, OcrEndpointConfig, OcrEndpointExtractor, OpenAiConfig, OpenAiEmbeddingClient,
    PipelineConfig, QdrantStore, RetrievalService, SearchQuery, VectorIndex,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-retrieval", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pipeline configuration as JSON. Defaults apply when omitted.
    #[arg(long, env = "DOC_RETRIEVAL_CONFIG")]
    config: Option<PathBuf>,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "documents")]
    qdrant_collection: String,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// Timeout applied to every backend HTTP request, in seconds.
    #[arg(long, env = "DOC_RETRIEVAL_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    /// OCR endpoint for images and PDFs without a text layer.
    #[arg(long, env = "OCR_ENDPOINT")]
    ocr_url: Option<String>,

    /// OCR endpoint bearer token
    #[arg(long, env = "OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
}

#[derive(Args)]
struct EmbeddingArgs {
    /// Embedding backend.
    #[arg(long, env = "EMBEDDER", value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Vector size for the n-gram embedder.
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    ngram_dimensions: usize,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_MODEL")]
    openai_model: Option<String>,

    /// Base URL of an OpenAI-compatible API.
    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    #[arg(long, env = "OPENAI_DIMENSIONS")]
    openai_dimensions: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Ngram,
    Openai,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder recursively, or a single file, into the collection.
    Ingest {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        folder: Option<PathBuf>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Delete stored chunks of each ingested source that the new run no longer produces.
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
    /// Similarity search with optional exact-match metadata filters.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Metadata filter as key=value. Repeat to AND several filters.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        /// Drop results scoring below this similarity.
        #[arg(long)]
        min_score: Option<f64>,
    },
    /// Number of stored chunks.
    Count,
    /// Delete chunks by id.
    Delete {
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },
    /// Delete every stored chunk.
    DeleteAll,
    /// Delete every chunk that came from one source path.
    PurgeSource {
        #[arg(long)]
        source: String,
    },
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    MetadataFilter::parse_pair(raw).ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn build_embedder(
    args: &EmbeddingArgs,
    timeout: Option<Duration>,
) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    match args.embedder {
        EmbedderKind::Ngram => Ok(Arc::new(CharacterNgramEmbedder::new(args.ngram_dimensions))),
        EmbedderKind::Openai => {
            let api_key = args
                .openai_api_key
                .clone()
                .context("--openai-api-key (or OPENAI_API_KEY) is required for the openai embedder")?;
            let mut config = OpenAiConfig::new(api_key);
            if let Some(model) = &args.openai_model {
                config.model = model.clone();
            }
            if let Some(base_url) = &args.openai_base_url {
                config.base_url = base_url.clone();
            }
            if let Some(dimensions) = args.openai_dimensions {
                config.dimensions = dimensions;
            }
            config.request_timeout = timeout;
            Ok(Arc::new(OpenAiEmbeddingClient::new(config)?))
        }
    }
}

fn build_extractors(cli: &Cli, timeout: Option<Duration>) -> anyhow::Result<ExtractorRegistry> {
    let registry = ExtractorRegistry::new();
    let Some(endpoint) = &cli.ocr_url else {
        return Ok(registry);
    };
    let ocr = OcrEndpointExtractor::new(OcrEndpointConfig {
        endpoint: endpoint.clone(),
        api_key: cli.ocr_api_key.clone(),
        request_timeout: timeout,
    })?;
    Ok(registry.with_ocr(ocr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let timeout = cli.request_timeout_secs.map(Duration::from_secs);
    let extractors = build_extractors(&cli, timeout)?;
    let embedder = build_embedder(&cli.embedding, timeout)?;
    let mut store = QdrantStore::with_timeout(
        &cli.qdrant_url,
        cli.qdrant_collection.clone(),
        embedder.dimensions(),
        timeout,
    )?;
    if let Some(api_key) = &cli.qdrant_api_key {
        store = store.with_api_key(api_key.clone());
    }

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        collection = %cli.qdrant_collection,
        dimensions = embedder.dimensions(),
        "doc-retrieval boot"
    );

    match cli.command {
        Command::Ingest {
            folder,
            file,
            replace,
        } => {
            store.ensure_collection().await?;
            let pipeline = IngestionPipeline::new(&config, extractors, embedder, store)?
                .replace_existing(replace);

            let documents = match (folder, file) {
                (Some(folder), _) => {
                    let report = pipeline.ingest_folder(&folder).await?;
                    for failed in &report.failed_documents {
                        warn!(path = %failed.path.display(), reason = %failed.reason, "skipped document");
                        println!("skipped {}: {}", failed.path.display(), failed.reason);
                    }
                    report.documents
                }
                (None, Some(file)) => vec![pipeline.ingest_path(&file).await?],
                (None, None) => anyhow::bail!("either --folder or --file is required"),
            };

            let mut stored = 0;
            for document in &documents {
                stored += document.stored_ids.len();
                println!(
                    "{} chunks={} stored={} dropped={}",
                    document.source,
                    document.total_chunks,
                    document.stored_ids.len(),
                    document.dropped_chunks()
                );
                for batch in &document.dropped_batches {
                    println!(
                        "  dropped chunks {}..{} after {} attempt(s): {}",
                        batch.first_index,
                        batch.first_index + batch.len,
                        batch.attempts,
                        batch.reason
                    );
                }
            }

            println!(
                "{} chunks from {} document(s) stored at {}",
                stored,
                documents.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Search {
            query,
            top_k,
            filters,
            min_score,
        } => {
            let mut search_query =
                SearchQuery::new(query, top_k).with_filter(filters.into_iter().collect());
            if let Some(min_score) = min_score {
                search_query = search_query.with_min_score(min_score);
            }

            let service = RetrievalService::new(embedder, store);
            let results = service.search(&search_query).await.map_err(|error| {
                if error.is_timeout() {
                    anyhow::anyhow!("search timed out: {error}")
                } else {
                    anyhow::Error::new(error)
                }
            })?;

            println!("query: {}", search_query.text);
            if results.is_empty() {
                println!("no matches");
            }
            for (rank, result) in results.iter().enumerate() {
                println!("[{}] score={:.4} id={}", rank + 1, result.score, result.id);
                for (key, value) in &result.metadata {
                    println!("  {key}={value}");
                }
                println!("  content:\n{}", result.content);
            }
        }
        Command::Count => {
            println!("{}", store.count().await?);
        }
        Command::Delete { ids } => {
            store.delete(&ids).await?;
            println!("deleted {} id(s)", ids.len());
        }
        Command::DeleteAll => {
            store.delete_all().await?;
            println!("collection {} cleared", store.collection());
        }
        Command::PurgeSource { source } => {
            store.delete_source(&source).await?;
            println!("purged {source}");
        }
    }

    Ok(())
}
