use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use lawtext_search_core::{
    AzureBlobStorage, CategoryClassifier, CharacterNgramEmbedder, Embedder, IndexConfig, Indexer,
    IngestionReport, LocalDirStorage, MirroredIndex, NeighborScope, OllamaEmbedder,
    RelevanceBand, RemoteStorage, SearchError, SearchQuery, StorageMirror, SyncOutcome,
    QueryEngine, VectorIndex, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "lawtext-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Persistent working directory for the index. A scratch directory is used when omitted.
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    /// Collection name inside the index.
    #[arg(long, global = true, default_value = IndexConfig::DEFAULT_COLLECTION)]
    collection: String,

    /// JSON lexicon mapping each category to its keywords.
    #[arg(long, global = true)]
    lexicon: Option<PathBuf>,

    /// Embedding backend.
    #[arg(long, global = true, value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Ollama base URL
    #[arg(long, global = true, env = "OLLAMA_HOST", default_value = "http://localhost:11434")]
    ollama_url: String,

    /// Ollama embedding model
    #[arg(long, global = true, default_value = OllamaEmbedder::DEFAULT_MODEL)]
    embedding_model: String,

    /// Vector length; defaults depend on the embedder.
    #[arg(long, global = true)]
    dimensions: Option<usize>,

    /// Where the index is mirrored between runs.
    #[arg(long, global = true, value_enum, default_value_t = MirrorKind::None)]
    mirror: MirrorKind,

    /// Root directory used by `--mirror dir`.
    #[arg(long, global = true)]
    mirror_dir: Option<PathBuf>,

    /// Remote prefix holding the mirrored index.
    #[arg(long, global = true, default_value = StorageMirror::DEFAULT_PREFIX)]
    mirror_prefix: String,

    /// Azure storage account
    #[arg(long, global = true, env = "AZURE_STORAGE_ACCOUNT")]
    azure_account: Option<String>,

    /// Azure storage access key
    #[arg(long, global = true, env = "AZURE_STORAGE_KEY", hide_env_values = true)]
    azure_key: Option<String>,

    /// Azure blob container
    #[arg(long, global = true, default_value = "data")]
    azure_container: String,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, classify and embed documents into the index.
    Index {
        /// Folder that contains `.txt` documents recursively.
        #[arg(long, conflicts_with = "remote_prefix", required_unless_present = "remote_prefix")]
        folder: Option<PathBuf>,
        /// Prefix on the mirror storage that holds the documents.
        #[arg(long)]
        remote_prefix: Option<String>,
    },
    /// Retrieve the closest chunks, each widened to its neighbors.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of hits to return.
        #[arg(long, default_value_t = SearchQuery::DEFAULT_TOP_K)]
        top_k: usize,
        /// Keep neighbor windows inside the hit's own document.
        #[arg(long, default_value_t = false)]
        same_source: bool,
    },
    /// Hydrate the index and push a full snapshot back to the mirror.
    Sync,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Ngram,
    Ollama,
}

#[derive(Clone, Copy, ValueEnum)]
enum MirrorKind {
    None,
    Dir,
    Azure,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "lawtext-search boot"
    );

    let embedder = build_embedder(&cli)?;
    let remote = build_remote(&cli)?;
    let mirror = remote
        .clone()
        .map(|storage| StorageMirror::new(storage, cli.mirror_prefix.clone()));

    let mut config = IndexConfig::new(embedder.model_name(), embedder.dimensions());
    config.collection = cli.collection.clone();
    config.local_dir = cli.index_dir.clone();

    let mut index = MirroredIndex::open(&config, mirror)
        .await
        .context("could not open the index")?;

    let outcome = run(&cli, &mut index, embedder.as_ref(), remote.as_deref()).await;

    let sync = index.shutdown().await;
    match &sync {
        SyncOutcome::Success { files } if *files > 0 => info!(files, "index mirrored"),
        SyncOutcome::Success { .. } => {}
        SyncOutcome::TransientFailure { failed, reason, .. } => {
            warn!(failed, %reason, "index mirror is behind the local copy");
        }
        SyncOutcome::FatalFailure { reason } => warn!(%reason, "index mirror rejected the upload"),
    }

    outcome?;
    if sync.is_fatal() {
        bail!("index changes could not be mirrored");
    }
    Ok(())
}

async fn run(
    cli: &Cli,
    index: &mut MirroredIndex,
    embedder: &dyn Embedder,
    remote: Option<&dyn RemoteStorage>,
) -> anyhow::Result<()> {
    match &cli.command {
        Command::Index {
            folder,
            remote_prefix,
        } => {
            let classifier = match &cli.lexicon {
                Some(path) => CategoryClassifier::load(path),
                None => {
                    warn!("no lexicon given, every chunk is categorised as unknown");
                    CategoryClassifier::unavailable()
                }
            };

            let mut indexer = Indexer::new(&mut *index, embedder, &classifier);
            let report = match (folder, remote_prefix) {
                (Some(folder), _) => indexer.index_folder(folder).await?,
                (None, Some(prefix)) => {
                    let Some(storage) = remote else {
                        bail!("--remote-prefix needs --mirror dir or --mirror azure");
                    };
                    indexer.index_remote(storage, prefix).await?
                }
                (None, None) => bail!("either --folder or --remote-prefix is required"),
            };
            print_ingestion(&report);
            println!(
                "{} chunks in collection at {}",
                index.count(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Search {
            query,
            top_k,
            same_source,
        } => {
            let mut search_query = SearchQuery::new(query.clone());
            search_query.top_k = *top_k;
            if *same_source {
                search_query.neighbor_scope = NeighborScope::SameSource;
            }

            let engine = QueryEngine::new(&*index, embedder);
            let result = match engine.search(&search_query).await {
                Ok(result) => result,
                Err(SearchError::EmptyQuery) => {
                    println!("empty query, nothing to search");
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            };

            println!("query: {}", result.query);
            if result.hits.is_empty() {
                println!("no indexed chunks");
            }
            for (rank, (hit, context)) in result.hits.iter().zip(&result.contexts).enumerate() {
                let relevance = hit.relevance_percent();
                println!(
                    "[{}] source={} category={} date={} relevance={:.1}% ({})",
                    rank + 1,
                    hit.metadata.source,
                    hit.metadata.category,
                    hit.metadata.date,
                    relevance,
                    band_label(RelevanceBand::from_percent(relevance)),
                );
                println!("  {}", collapse_whitespace(context));
            }
        }
        Command::Sync => {
            if !index.is_hydrated() {
                warn!("mirror was only partly hydrated, the upload replaces it with the local copy");
            }
            let outcome = index.force_flush().await;
            println!("{} chunks, mirror sync: {outcome:?}", index.count());
        }
    }

    Ok(())
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Box<dyn Embedder>> {
    Ok(match cli.embedder {
        EmbedderKind::Ngram => Box::new(CharacterNgramEmbedder {
            dimensions: cli.dimensions.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        }),
        EmbedderKind::Ollama => Box::new(OllamaEmbedder::new(
            &cli.ollama_url,
            &cli.embedding_model,
            cli.dimensions.unwrap_or(OllamaEmbedder::DEFAULT_DIMENSIONS),
        )?),
    })
}

fn build_remote(cli: &Cli) -> anyhow::Result<Option<Arc<dyn RemoteStorage>>> {
    Ok(match cli.mirror {
        MirrorKind::None => None,
        MirrorKind::Dir => {
            let Some(root) = &cli.mirror_dir else {
                bail!("--mirror dir needs --mirror-dir");
            };
            Some(Arc::new(LocalDirStorage::new(root)))
        }
        MirrorKind::Azure => {
            let (Some(account), Some(key)) = (&cli.azure_account, &cli.azure_key) else {
                bail!("--mirror azure needs AZURE_STORAGE_ACCOUNT and AZURE_STORAGE_KEY");
            };
            Some(Arc::new(AzureBlobStorage::new(
                account.as_str(),
                key,
                cli.azure_container.as_str(),
            )?))
        }
    })
}

fn print_ingestion(report: &IngestionReport) {
    if !report.skipped_files.is_empty() {
        warn!(count = report.skipped_files.len(), "skipped files");
        for skipped in &report.skipped_files {
            warn!(path = %skipped.path, reason = %skipped.reason, "skipped document");
        }
    }
    for document in &report.documents {
        println!(
            "{}: inserted={} existing={} failed={}",
            document.file_id, document.inserted, document.skipped_existing, document.failed
        );
    }
    println!(
        "{} chunks inserted, {} failed",
        report.inserted(),
        report.failed()
    );
}

fn band_label(band: RelevanceBand) -> &'static str {
    match band {
        RelevanceBand::High => "high",
        RelevanceBand::Medium => "medium",
        RelevanceBand::Low => "low",
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
