//! Maintenance CLI: backfill, stats and context retrieval against a
//! configured deployment.

#[cfg(feature = "cli")]
mod cli {
    use clap::{Parser, Subcommand};
    use std::sync::Arc;
    use stratum_memory::config::Config;
    use stratum_memory::context_engine::{
        AssemblerConfig, BatchOptions, BudgetCompressor, Chunker, ChunkerConfig,
        CompressorConfig, ContextAssembler, ContextOptions, CoordinatorConfig,
        GatedIntentClassifier, Indexer, IndexerConfig, MemoryCoordinator, ModelIntentStrategy,
    };
    use stratum_memory::providers::{
        GatewayConfig, HttpEmbeddingProvider, HttpIntentProvider, HttpSummaryProvider,
        ModelGateway,
    };
    use stratum_memory::{LocalVectorIndex, MemoryDatabase, VectorIndex};

    #[derive(Parser)]
    #[command(name = "stratum-memory", about = "Conversation-memory maintenance tools")]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Chunk and embed a user's eligible conversations
        Backfill {
            #[arg(long)]
            user: String,
            #[arg(long, default_value_t = 20)]
            min_messages: usize,
            #[arg(long, default_value_t = 10)]
            max_conversations: usize,
        },
        /// Memory-subsystem stats for one conversation
        Stats {
            #[arg(long)]
            conversation: String,
        },
        /// Row counts and file size for the whole database
        DbStats,
        /// Assemble and print the context for a query
        Context {
            #[arg(long)]
            conversation: String,
            #[arg(long)]
            user: String,
            #[arg(long)]
            query: String,
        },
    }

    fn build_coordinator(
        config: &Config,
        database: Arc<MemoryDatabase>,
    ) -> anyhow::Result<MemoryCoordinator> {
        let vectors: Arc<dyn VectorIndex> =
            Arc::new(LocalVectorIndex::open(&config.vector_index_path)?);

        let gateway = Arc::new(ModelGateway::new(GatewayConfig {
            base_url: config.gateway_url.clone(),
            api_key: config.gateway_api_key.clone(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimension: config.embedding_dimension,
            request_timeout_seconds: config.request_timeout_seconds,
        }));

        let indexer = Arc::new(Indexer::new(
            Arc::clone(&database),
            vectors,
            Arc::new(HttpEmbeddingProvider::new(Arc::clone(&gateway))),
            IndexerConfig {
                chunk_namespace: config.chunk_namespace.clone(),
                conversation_namespace: config.conversation_namespace.clone(),
                ..IndexerConfig::default()
            },
        ));
        let chunker = Chunker::new(
            Arc::clone(&database),
            Arc::new(HttpSummaryProvider::new(Arc::clone(&gateway))),
            ChunkerConfig::default(),
        );
        let assembler = ContextAssembler::new(
            Arc::clone(&database),
            Arc::clone(&indexer),
            AssemblerConfig::default(),
        );
        let intent = GatedIntentClassifier::new(
            Some(ModelIntentStrategy::new(Arc::new(HttpIntentProvider::new(
                gateway,
            )))),
            0.75,
        );

        Ok(MemoryCoordinator::new(
            database,
            chunker,
            indexer,
            assembler,
            BudgetCompressor::new(CompressorConfig::default()),
            intent,
            CoordinatorConfig {
                auto_chunking: config.auto_chunking,
                ..CoordinatorConfig::default()
            },
        ))
    }

    pub async fn run() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        stratum_memory::telemetry::init_tracing();

        let cli = Cli::parse();
        let config = Config::from_env()?;
        config.validate()?;
        let database = Arc::new(MemoryDatabase::new(&config.database_path)?);
        let coordinator = build_coordinator(&config, Arc::clone(&database))?;

        match cli.command {
            Command::Backfill {
                user,
                min_messages,
                max_conversations,
            } => {
                let report = coordinator
                    .batch_process_user_conversations(
                        &user,
                        &BatchOptions {
                            min_messages,
                            max_conversations,
                        },
                    )
                    .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Command::Stats { conversation } => {
                let stats = coordinator.get_conversation_stats(&conversation)?;
                println!("messages:        {}", stats.message_count);
                println!("chunks:          {}", stats.chunk_count);
                println!(
                    "last chunked:    {}",
                    stats
                        .last_chunked_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
                println!("needs chunking:  {}", stats.needs_chunking);
                match stats.compression_stats {
                    Some(c) => println!("compression:     level {} (ratio {:.2})", c.level, c.ratio),
                    None => println!("compression:     none"),
                }
            }
            Command::DbStats => {
                let stats = database.get_stats()?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            Command::Context {
                conversation,
                user,
                query,
            } => {
                let response = coordinator
                    .get_conversation_context(&conversation, &user, &query, &ContextOptions::default())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&response.stats)?);
                println!("---");
                println!("{}", response.formatted_context);
            }
        }
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
