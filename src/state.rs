use std::sync::{Arc, RwLock};

use crate::chat::{ActiveStreams, LocalBackend};
use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::{EmbeddingService, OpenAiEmbedder};
use crate::error::{AppError, Result};
use crate::ingest::Ingestor;
use crate::llm::Provider;
use crate::retrieval::{HttpReranker, Retriever};
use crate::tools::ToolInvoker;

/// Process-lifetime state that is never written to disk.
#[derive(Default)]
pub struct RuntimeState {
    pub streams: Arc<ActiveStreams>,
}

/// Clients built from the current configuration.
struct Services {
    backend: Arc<LocalBackend>,
    ingestor: Arc<Ingestor>,
    retriever: Arc<Retriever>,
}

pub struct AppState {
    pub db: Arc<Database>,
    pub runtime: RuntimeState,
    config: RwLock<AppConfig>,
    services: RwLock<Services>,
    tools: Option<Arc<dyn ToolInvoker>>,
}

impl AppState {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let config = AppConfig::load(&db)?;
        Ok(Self::with_config(db, config, None))
    }

    pub fn with_config(
        db: Arc<Database>,
        config: AppConfig,
        tools: Option<Arc<dyn ToolInvoker>>,
    ) -> Self {
        let runtime = RuntimeState::default();
        let services = build_services(&db, &config, &runtime, tools.clone());
        Self {
            db,
            runtime,
            config: RwLock::new(config),
            services: RwLock::new(services),
            tools,
        }
    }

    pub fn config(&self) -> Result<AppConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| AppError::LockPoisoned("config"))
    }

    /// Validate, persist and apply a new configuration. Open streams keep
    /// running; later turns use the new clients.
    pub fn save_config(&self, config: AppConfig) -> Result<()> {
        config.save(&self.db)?;
        let services = build_services(&self.db, &config, &self.runtime, self.tools.clone());
        *self
            .services
            .write()
            .map_err(|_| AppError::LockPoisoned("services"))? = services;
        *self
            .config
            .write()
            .map_err(|_| AppError::LockPoisoned("config"))? = config;
        Ok(())
    }

    fn services(&self) -> Result<std::sync::RwLockReadGuard<'_, Services>> {
        self.services
            .read()
            .map_err(|_| AppError::LockPoisoned("services"))
    }

    pub fn backend(&self) -> Result<Arc<LocalBackend>> {
        Ok(self.services()?.backend.clone())
    }

    pub fn ingestor(&self) -> Result<Arc<Ingestor>> {
        Ok(self.services()?.ingestor.clone())
    }

    pub fn retriever(&self) -> Result<Arc<Retriever>> {
        Ok(self.services()?.retriever.clone())
    }
}

fn build_services(
    db: &Arc<Database>,
    config: &AppConfig,
    runtime: &RuntimeState,
    tools: Option<Arc<dyn ToolInvoker>>,
) -> Services {
    let provider = Provider::from_endpoint(&config.llm_base_url, &config.api_key);
    let embedder = OpenAiEmbedder::new(provider.config().clone(), config.embedding_model.clone());
    let embeddings = EmbeddingService::new(Arc::new(embedder), config.normalize_embeddings);

    let mut retriever = Retriever::new(db.clone(), embeddings.clone());
    if let Some(model) = &config.reranker_model {
        retriever = retriever.with_reranker(Arc::new(HttpReranker::new(
            provider.config().clone(),
            model.clone(),
        )));
    }
    let retriever = Arc::new(retriever);
    let ingestor = Arc::new(Ingestor::new(
        db.clone(),
        embeddings,
        config.chunk_size,
        config.chunk_overlap,
    ));

    let mut backend = LocalBackend::new(db.clone(), Arc::new(provider))
        .with_streams(runtime.streams.clone())
        .with_ingestor(ingestor.clone())
        .with_retriever(retriever.clone())
        .with_idle_timeout(std::time::Duration::from_secs(config.stream_idle_timeout_secs));
    if let Some(tools) = tools {
        backend = backend.with_tools(tools);
    }

    tracing::debug!(
        base_url = %config.llm_base_url,
        embedding_model = %config.embedding_model,
        reranker = ?config.reranker_model,
        "Built model clients"
    );
    Services {
        backend: Arc::new(backend),
        ingestor,
        retriever,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saving_config_rebuilds_clients_but_keeps_streams() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state = AppState::new(db).unwrap();
        let before = state.backend().unwrap();
        state.runtime.streams.register("s1").unwrap();

        let config = AppConfig {
            model_name: "qwen2.5".into(),
            reranker_model: Some("bge-reranker".into()),
            ..state.config().unwrap()
        };
        state.save_config(config.clone()).unwrap();

        let after = state.backend().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.streams().is_active("s1"));
        assert_eq!(state.config().unwrap(), config);
        assert_eq!(AppConfig::load(&state.db).unwrap(), config);
    }

    #[test]
    fn invalid_config_is_not_applied() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state = AppState::new(db).unwrap();
        let bad = AppConfig {
            top_p: 0.0,
            ..AppConfig::default()
        };
        assert!(state.save_config(bad).is_err());
        assert_eq!(state.config().unwrap(), AppConfig::default());
    }
}
