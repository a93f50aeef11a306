use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{BrowserContext, BrowserPool, HttpBrowser, WebDriverBrowser};
use crate::cli::config::AppConfig;
use crate::nodes::NodeRegistry;
use crate::recovery::{AiClient, OpenAiClient, RecoverySystem, RuleSet};
use crate::storage::{
    MemoryExecutionRepo, MemoryExtractedItemRepo, MemoryNodeExecutionRepo, MemoryUrlQueue,
    RedisUrlQueue, UrlQueue,
};
use crate::workflow::dag::NodeDag;
use crate::workflow::events::{EventBroadcaster, EventType};
use crate::workflow::types::Workflow;
use crate::workflow::WorkflowExecutor;

/// Run a workflow definition to completion.
pub async fn run(workflow_file: PathBuf, profile: Option<String>, start_url: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let mut workflow = Workflow::from_yaml_file(&workflow_file)
        .context(format!("Failed to load workflow: {}", workflow_file.display()))?;
    if let Some(url) = start_url {
        workflow.start_urls = vec![url];
    }
    if workflow.start_urls.is_empty() {
        anyhow::bail!("Workflow has no start URLs; pass one with --url");
    }

    let queue = build_queue(&config).await?;
    let node_repo = Arc::new(MemoryNodeExecutionRepo::default());
    let item_repo = Arc::new(MemoryExtractedItemRepo::default());
    let execution_repo = Arc::new(MemoryExecutionRepo::default());
    let pool = Arc::new(BrowserPool::new(build_browsers(&config)?));

    let ai: Option<Arc<dyn AiClient>> = if config.recovery.ai.enabled {
        Some(Arc::new(OpenAiClient::from_settings(&config.recovery.ai)?))
    } else {
        None
    };
    let recovery = Arc::new(RecoverySystem::new(
        config.recovery.clone(),
        ai,
        config.browser.pool_size,
    ));

    let events = EventBroadcaster::new(1024);
    spawn_event_printer(&events).await;

    let executor = WorkflowExecutor::new(
        workflow,
        NodeRegistry::builtin(),
        queue,
        node_repo,
        item_repo.clone(),
        execution_repo,
        pool,
        recovery,
        events,
        config.executor.clone(),
    );

    let execution_id = Uuid::new_v4().to_string();
    info!("Starting execution {}", execution_id);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current URL");
            let _ = cancel_tx.send(true);
        }
    });

    let stats = executor.run(&execution_id, cancel_rx).await?;

    println!("Execution:       {}", execution_id);
    println!("URLs discovered: {}", stats.urls_discovered);
    println!("URLs processed:  {}", stats.urls_processed);
    println!("URLs failed:     {}", stats.urls_failed);
    println!("Items extracted: {}", stats.items_extracted);
    println!("Nodes executed:  {}", stats.nodes_executed);
    println!("Duration:        {}ms", stats.duration_ms);

    let items = item_repo.all(&execution_id).await;
    if !items.is_empty() {
        let json = serde_json::to_string_pretty(&items)?;
        let output = PathBuf::from(format!("{}.json", execution_id));
        std::fs::write(&output, json)
            .context(format!("Failed to write {}", output.display()))?;
        println!("Items written:   {}", output.display());
    }

    Ok(())
}

/// Validate a workflow definition without running it.
pub async fn validate(workflow_file: PathBuf) -> Result<()> {
    let workflow = Workflow::from_yaml_file(&workflow_file)
        .context(format!("Failed to load workflow: {}", workflow_file.display()))?;

    let registry = NodeRegistry::builtin();
    registry.validate_workflow(&workflow)?;

    println!("Workflow: {} ({})", workflow.name, workflow.id);
    for phase in &workflow.phases {
        let dag = NodeDag::build(&phase.nodes)?;
        let order: Vec<&str> = dag
            .ordered(&phase.nodes)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        println!("  phase {}: {} node(s), order: {}", phase.id, phase.nodes.len(), order.join(" -> "));
    }
    println!("OK");
    Ok(())
}

/// List the recovery rules that would be active for a profile.
pub async fn rules(profile: Option<String>) -> Result<()> {
    // The learned rules live inside an execution; outside of one, the
    // predefined set is what there is to inspect
    if let Some(name) = profile {
        AppConfig::load_profile(&name).context(format!("Failed to load profile: {}", name))?;
    }
    let rules = RuleSet::with_predefined();
    for rule in rules.rules() {
        println!(
            "[{:>3}] {} ({}) domain={} confidence={:.2}",
            rule.priority, rule.id, rule.name, rule.context.domain_pattern, rule.confidence
        );
        for condition in &rule.conditions {
            println!("      when {} {:?} {}", condition.field, condition.operator, condition.value);
        }
        for action in &rule.actions {
            println!("      then {}", action.action);
        }
    }
    Ok(())
}

/// Show the current configuration.
pub async fn show_config() -> Result<()> {
    let config = AppConfig::load_default()?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

/// List all available profiles.
pub async fn list_profiles() -> Result<()> {
    let profiles = AppConfig::list_profiles()?;
    if profiles.is_empty() {
        println!("No profiles found");
    } else {
        for profile in profiles {
            println!("{}", profile);
        }
    }
    Ok(())
}

/// Create or show a named profile.
pub async fn manage_profile(profile: String) -> Result<()> {
    match AppConfig::load_profile(&profile) {
        Ok(config) => {
            let yaml = serde_yaml::to_string(&config)?;
            println!("{}", yaml);
        }
        Err(_) => {
            info!("Profile '{}' not found, creating it from defaults", profile);
            let config = AppConfig::default();
            config.save_as_profile(&profile)?;
            println!("Created profile '{}'", profile);
        }
    }
    Ok(())
}

fn load_config(profile: Option<String>) -> Result<AppConfig> {
    match profile {
        Some(name) => AppConfig::load_profile(&name)
            .context(format!("Failed to load profile: {}", name)),
        None => AppConfig::load_default(),
    }
}

async fn build_queue(config: &AppConfig) -> Result<Arc<dyn UrlQueue>> {
    match config.queue.backend.as_str() {
        "redis" => {
            let queue = RedisUrlQueue::new(
                &config.queue.redis_url,
                config.queue.task_ttl,
                config.queue.max_url_retries,
            )
            .await
            .context("Failed to connect to Redis")?;
            Ok(Arc::new(queue))
        }
        "memory" => Ok(Arc::new(MemoryUrlQueue::new(config.queue.max_url_retries))),
        other => anyhow::bail!("Unknown queue backend '{}'", other),
    }
}

fn build_browsers(config: &AppConfig) -> Result<Vec<Box<dyn BrowserContext>>> {
    let mut browsers: Vec<Box<dyn BrowserContext>> = Vec::new();
    for _ in 0..config.browser.pool_size.max(1) {
        match config.browser.backend.as_str() {
            "webdriver" => browsers.push(Box::new(WebDriverBrowser::new(config.browser.clone()))),
            "http" => browsers.push(Box::new(HttpBrowser::new(
                config.browser.clone(),
                config.crawler.politeness_delay_ms,
            )?)),
            other => anyhow::bail!("Unknown browser backend '{}'", other),
        }
    }
    Ok(browsers)
}

async fn spawn_event_printer(events: &EventBroadcaster) {
    let Some((_, mut rx)) = events.subscribe().await else {
        return;
    };
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.event_type {
                EventType::StatsUpdated => {
                    info!(
                        "progress: {} processed, {} failed, {} items",
                        event.data["urls_processed"],
                        event.data["urls_failed"],
                        event.data["items_extracted"]
                    );
                }
                EventType::ItemExtracted => {
                    info!("extracted item from {}", event.data["url"]);
                }
                EventType::PhaseFailed => {
                    warn!("{} failed: {}", event.data["url"], event.data["error"]);
                }
                _ => {}
            }
        }
    });
}

/// Summarize the JSON items file a previous `run` wrote.
pub async fn inspect(output_file: PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(&output_file)
        .context(format!("Failed to read {}", output_file.display()))?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .context("Output file is not a JSON item array")?;
    println!("{}: {} item(s)", output_file.display(), items.len());
    if let Some(first) = items.first() {
        println!("first item:\n{}", serde_json::to_string_pretty(first)?);
    }
    Ok(())
}
