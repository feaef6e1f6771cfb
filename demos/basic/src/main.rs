use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use jobpipe::{
    deps::{BroadcastError, TracingLogger},
    prelude::*,
};
use serde_json::{json, Value};

const FETCH_PAGE: &str = "fetch_page";
const COUNT_WORDS: &str = "count_words";

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let container = ServiceContainer::new()
        .with_logger(Arc::new(TracingLogger))
        .with_status_broadcaster(Arc::new(PrintingBroadcaster));

    let pages = MemoryQueue::new("pages");
    let words = MemoryQueue::new("words").with_max_attempts(1);

    let mut registry = WorkerRegistry::new(container);
    registry
        .spawn("pages", pages.clone(), PageWorker)
        .await?
        .spawn("words", words.clone(), WordCountWorker)
        .await?;
    registry.validate()?;

    let job_id = pages.enqueue(json!({"url": "https://example.com", "importId": "import-1"}))?;
    println!("Inserted job {job_id}");
    let job_id = pages.enqueue(json!({"noteId": "note-1"}))?;
    println!("Inserted job {job_id}");
    let job_id = words.enqueue(json!({"text": "one two three"}))?;
    println!("Inserted job {job_id}");

    tokio::time::sleep(Duration::from_secs(2)).await;

    for (job, result) in pages.completed().into_iter().chain(words.completed()) {
        println!("Job {} completed with {result}", job.job_id());
    }
    for (job, error) in pages.discarded().into_iter().chain(words.discarded()) {
        println!("Job {} discarded: {error}", job.job_id());
    }

    pages.close();
    words.close();
    registry.graceful_shutdown().await?;
    Ok(())
}

struct PrintingBroadcaster;

#[async_trait]
impl StatusBroadcaster for PrintingBroadcaster {
    async fn add_status_event_and_broadcast(&self, event: StatusEvent) -> Result<(), BroadcastError> {
        println!(
            "[{}] {}",
            event.status,
            event.message.as_deref().unwrap_or_default()
        );
        Ok(())
    }
}

struct FetchPage;

#[async_trait]
impl Action<BaseDependencies> for FetchPage {
    fn name(&self) -> &str {
        FETCH_PAGE
    }

    async fn execute(
        &self,
        data: &Value,
        _deps: &BaseDependencies,
        _context: &ActionContext,
    ) -> ActionResult {
        let url = data["url"].as_str().unwrap_or_default();
        Ok(json!({"url": url, "html": format!("<html><title>{url}</title></html>")}))
    }
}

struct PageWorker;

#[async_trait]
impl Worker for PageWorker {
    type Deps = BaseDependencies;

    fn operation_name(&self) -> &'static str {
        "scrape_page"
    }

    fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>) {
        factory
            .register(VALIDATION, |_deps| {
                Box::new(ValidationAction::new(|data| {
                    data.get("url")
                        .is_none()
                        .then(|| ActionValidationError::new("url is required"))
                }))
            })
            .register(LOGGING, |_deps| {
                Box::new(LoggingAction::dynamic(|data, _context| {
                    format!("Fetched {}", data["url"])
                }))
            })
            .register_with_wrappers(
                FETCH_PAGE,
                |_deps| Box::new(FetchPage),
                vec![with_retry(RetryPolicy::default()), with_status_broadcast()],
            );
    }

    fn create_action_pipeline(
        &self,
        data: &Value,
        _context: &ActionContext,
        factory: &ActionFactory<Self::Deps>,
        deps: &Self::Deps,
    ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
        let mut pipeline = vec![
            factory.create(VALIDATION, deps)?,
            factory.create(FETCH_PAGE, deps)?,
            factory.create(LOGGING, deps)?,
        ];
        self.inject_standard_status_actions(&mut pipeline, data);
        Ok(pipeline)
    }

    fn concurrency(&self) -> Option<usize> {
        Some(2)
    }
}

struct CountWords;

#[async_trait]
impl Action<BaseDependencies> for CountWords {
    fn name(&self) -> &str {
        COUNT_WORDS
    }

    async fn execute(
        &self,
        data: &Value,
        _deps: &BaseDependencies,
        _context: &ActionContext,
    ) -> ActionResult {
        let text = data["text"]
            .as_str()
            .ok_or_else(|| ActionError::message("text must be a string"))?;
        Ok(json!({"words": text.split_whitespace().count()}))
    }
}

struct WordCountWorker;

#[async_trait]
impl Worker for WordCountWorker {
    type Deps = BaseDependencies;

    fn operation_name(&self) -> &'static str {
        "count_words"
    }

    fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>) {
        factory.register(COUNT_WORDS, |_deps| Box::new(CountWords));
    }

    fn create_action_pipeline(
        &self,
        _data: &Value,
        _context: &ActionContext,
        factory: &ActionFactory<Self::Deps>,
        deps: &Self::Deps,
    ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
        Ok(vec![factory.create_error_handled(COUNT_WORDS, deps)?])
    }

    fn inject_standard_status_actions(
        &self,
        _actions: &mut Pipeline<Self::Deps>,
        _data: &Value,
    ) {
    }
}
