use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use dojo_judge::config::AppConfig;
use dojo_judge::coordinator::Coordinator;
use dojo_judge::curriculum::JsonCurriculum;
use dojo_judge::languages::LanguageRegistry;
use dojo_judge::normalizer::Normalizer;
use dojo_judge::progress::{InMemoryProgress, ProgressTracker, RedisProgressTracker};
use dojo_judge::runner::SandboxedRunner;
use dojo_judge::sandbox::{self, IsolationLevel};
use dojo_judge::server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dojo_judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    info!("Starting Dojo Judge...");

    // Load language configurations
    let languages = match &config.languages_config {
        Some(path) => {
            let registry = LanguageRegistry::load(path)?;
            info!("Loaded language configurations from {}", path.display());
            registry
        }
        None => LanguageRegistry::embedded()?,
    };
    info!("Languages: {}", languages.names().join(", "));

    // Fail fast when isolation is mandatory but the host cannot provide it
    if config.sandbox.isolation == IsolationLevel::Required {
        sandbox::ensure_namespace_isolation_available().await?;
        info!("Confirmed namespace sandbox support is available");
    }

    let runner = SandboxedRunner::new(config.sandbox.clone())
        .await
        .context("Failed to initialize sandboxed runner")?;

    let mut normalizer = Normalizer::new(languages);
    if let Some(root) = &config.work_root {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create work root {}", root.display()))?;
        normalizer = normalizer.with_work_root(root);
    }

    let curriculum = JsonCurriculum::new(&config.curriculum_path);
    info!("Curriculum: {}", curriculum.path().display());

    let progress: Arc<dyn ProgressTracker> = match &config.redis_url {
        Some(url) => Arc::new(RedisProgressTracker::connect(url).await?),
        None => {
            info!("DOJO_REDIS_URL not set; progress is kept in memory");
            Arc::new(InMemoryProgress::new())
        }
    };

    info!(
        "Limits: time={}ms memory={}MB output={}B, lesson gating: {}",
        config.limits.time_ms,
        config.limits.memory_mb,
        config.limits.max_output_bytes,
        config.gating
    );

    let coordinator = Coordinator::new(
        normalizer,
        Arc::new(runner),
        Arc::new(curriculum),
        progress,
        config.limits.clone(),
    )
    .with_gate(config.gating);

    server::serve(&config.bind_addr, Arc::new(coordinator)).await
}
