use std::collections::HashMap;
use std::sync::Arc;

use atelier_contracts::events::EventWriter;
use atelier_contracts::models::{ModelRegistry, ModelSelector, RegistryError};
use atelier_contracts::requests::{normalize, InferenceRequest, RawRequest};
use atelier_contracts::retry::RetryPolicy;
use atelier_contracts::TaskKind;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, TokioClock};
use crate::config::GatewayConfig;
use crate::encoder::{encode, InferenceResult};
use crate::error::GatewayError;
use crate::invoker::{emit, RetryingInvoker};
use crate::media::ImageFetcher;
use crate::providers::{
    DryrunProvider, HuggingFaceProvider, InferenceProvider, OpenRouterProvider, ProviderRegistry,
};

/// Normalizer, resolver, invoker and encoder wired together for every task kind.
#[derive(Clone)]
pub struct Gateway {
    selector: ModelSelector,
    invoker: RetryingInvoker,
    events: Option<EventWriter>,
    policies: HashMap<TaskKind, RetryPolicy>,
    images: Option<ImageFetcher>,
}

impl Gateway {
    /// Fails when the model tables are malformed, so a bad table stops start-up
    /// instead of surfacing per request.
    pub fn new(
        registry: ModelRegistry,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RegistryError> {
        registry.validate()?;
        Ok(Self {
            selector: ModelSelector::new(Some(registry)),
            invoker: RetryingInvoker::new(providers, clock),
            events: None,
            policies: HashMap::new(),
            images: None,
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut providers = ProviderRegistry::new();
        if config.dryrun {
            let dryrun: Arc<dyn InferenceProvider> = Arc::new(DryrunProvider);
            providers.register_as("huggingface", Arc::clone(&dryrun));
            providers.register_as("openrouter", Arc::clone(&dryrun));
            providers.register_as("dryrun", dryrun);
        } else {
            providers.register(HuggingFaceProvider::new(
                config.huggingface_api_base.clone(),
                config.huggingface_api_key.clone(),
                config.request_timeout,
            )?);
            providers.register(OpenRouterProvider::new(
                config.openrouter_api_base.clone(),
                config.openrouter_api_key.clone(),
                config.openrouter_referer.clone(),
                config.request_timeout,
            )?);
            providers.register(DryrunProvider);
        }
        let mut gateway = Self::new(
            ModelRegistry::default(),
            providers,
            Arc::new(TokioClock::default()),
        )?;
        if !config.dryrun {
            gateway = gateway.with_image_fetcher(ImageFetcher::new(config.request_timeout)?);
        }
        if let Some(path) = &config.events_path {
            gateway = gateway.with_events(EventWriter::new(path, "gateway"));
        }
        Ok(gateway)
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Image URLs are downloaded before the candidate loop when a fetcher is set.
    pub fn with_image_fetcher(mut self, images: ImageFetcher) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_policy(mut self, task: TaskKind, policy: RetryPolicy) -> Self {
        self.policies.insert(task, policy);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.selector.registry
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.invoker.providers().names()
    }

    pub fn policy(&self, task: TaskKind) -> RetryPolicy {
        self.policies
            .get(&task)
            .copied()
            .unwrap_or_else(|| RetryPolicy::for_task(task))
    }

    pub async fn handle(&self, task: TaskKind, raw: RawRequest) -> Result<InferenceResult, GatewayError> {
        let request = normalize(task, raw)?;
        self.execute(request).await
    }

    pub async fn execute(&self, request: InferenceRequest) -> Result<InferenceResult, GatewayError> {
        let run_id = Uuid::new_v4().to_string();
        let events = self.events.as_ref().map(|events| events.for_run(run_id.as_str()));
        let task = request.task;

        let selection = self
            .selector
            .resolve(task, request.model_key.as_deref(), request.capability())?;
        let request = match &self.images {
            Some(images) => images.inline(request).await?,
            None => request,
        };
        let aliases: Vec<&str> = selection
            .candidates
            .iter()
            .map(|candidate| candidate.alias.as_str())
            .collect();
        info!(
            %task,
            run_id = %run_id,
            leader = %selection.leader().alias,
            candidates = ?aliases,
            "invocation started"
        );
        if let Some(reason) = &selection.fallback_reason {
            info!(%task, "{reason}");
        }
        emit(
            events.as_ref(),
            "invocation_started",
            json!({
                "task": task,
                "requested": selection.requested,
                "prompt_chars": request.prompt().map(|prompt| prompt.chars().count()),
                "candidates": aliases,
                "fallback_reason": selection.fallback_reason,
            }),
        );

        let outcome = self
            .invoker
            .invoke(&request, &selection.candidates, self.policy(task), events.as_ref())
            .await
            .and_then(|invocation| {
                let mut result = encode(task, &invocation.candidate, invocation.reply)?;
                result.requested_model = selection.requested.clone();
                result.fallback_reason = selection.fallback_reason.clone();
                result.warnings = invocation.warnings;
                result.attempts = invocation.attempts;
                if let Some(op) = request.capability() {
                    result
                        .metadata
                        .insert("task".to_string(), Value::String(op.to_string()));
                }
                Ok(result)
            });

        match &outcome {
            Ok(result) => {
                info!(
                    %task,
                    model = %result.used_model,
                    attempts = result.attempts.len(),
                    "invocation succeeded"
                );
                emit(
                    events.as_ref(),
                    "invocation_finished",
                    json!({
                        "success": true,
                        "model": result.used_model,
                        "alias": result.used_alias,
                        "attempts": result.attempts.len(),
                    }),
                );
            }
            Err(err) => {
                warn!(%task, kind = err.kind(), error = %err, "invocation failed");
                emit(
                    events.as_ref(),
                    "invocation_finished",
                    json!({
                        "success": false,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        outcome
    }

    pub fn failure_envelope(&self, task: TaskKind, err: &GatewayError) -> Value {
        json!({
            "success": false,
            "error": err.to_string(),
            "hint": err.hint(),
            "kind": err.kind(),
            "availableModels": self.registry().aliases(task),
        })
    }

    /// Registry listing per task: alias, backend id, provider, limits, default flag.
    pub fn models_overview(&self) -> Value {
        let mut tasks = Map::new();
        for (task, table) in self.registry().tasks() {
            let models: Vec<Value> = table
                .candidates
                .values()
                .map(|candidate| {
                    let mut row = serde_json::to_value(candidate).unwrap_or_else(|_| json!({}));
                    if let Value::Object(obj) = &mut row {
                        obj.insert(
                            "default".to_string(),
                            Value::Bool(candidate.alias == table.default_alias),
                        );
                    }
                    row
                })
                .collect();
            tasks.insert(
                task.to_string(),
                json!({
                    "default": table.default_alias,
                    "outputField": task.output_field(),
                    "models": models,
                }),
            );
        }
        json!({ "tasks": tasks })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use atelier_contracts::models::ModelRegistry;
    use atelier_contracts::outcome::ProviderFailure;
    use atelier_contracts::requests::{ChatMessage, RawRequest};
    use atelier_contracts::retry::RetryPolicy;
    use atelier_contracts::TaskKind;
    use serde_json::{json, Value};

    use super::Gateway;
    use crate::clock::ManualClock;
    use crate::config::GatewayConfig;
    use crate::error::GatewayError;
    use crate::media::ImageFetcher;
    use crate::providers::{
        DryrunProvider, InferenceProvider, ProviderCall, ProviderRegistry, ProviderReply,
    };

    /// Answers every call the same way and counts calls.
    struct FixedProvider {
        reply: Result<ProviderReply, ProviderFailure>,
        calls: AtomicUsize,
        backends: std::sync::Mutex<Vec<String>>,
    }

    impl FixedProvider {
        fn new(reply: Result<ProviderReply, ProviderFailure>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                backends: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.backends
                .lock()
                .unwrap()
                .push(call.backend_id.to_string());
            self.reply.clone()
        }
    }

    fn gateway_with(provider: Arc<dyn InferenceProvider>) -> Gateway {
        let mut providers = ProviderRegistry::new();
        providers.register_as("huggingface", Arc::clone(&provider));
        providers.register_as("openrouter", provider);
        Gateway::new(ModelRegistry::default(), providers, Arc::new(ManualClock::new())).unwrap()
    }

    #[tokio::test]
    async fn unknown_alias_is_served_by_default_backend() {
        let provider = FixedProvider::new(Ok(ProviderReply::Json(json!([
            {"generated_text": " hello back "}
        ]))));
        let gateway = gateway_with(provider.clone());
        let raw = RawRequest {
            prompt: Some("hello".to_string()),
            model: Some("unknown-alias".to_string()),
            ..RawRequest::default()
        };

        let result = gateway.handle(TaskKind::TextGeneration, raw).await.unwrap();
        let default_backend = gateway
            .registry()
            .default_candidate(TaskKind::TextGeneration)
            .unwrap()
            .backend_id
            .clone();

        let envelope = result.to_envelope();
        assert_eq!(envelope["success"], json!(true));
        assert_eq!(envelope["text"], json!("hello back"));
        assert_eq!(envelope["model"], json!(default_backend));
        assert_eq!(envelope["requestedModel"], json!("unknown-alias"));
        assert!(envelope["fallbackReason"]
            .as_str()
            .unwrap()
            .contains("'unknown-alias'"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*provider.backends.lock().unwrap(), vec![default_backend]);
    }

    #[tokio::test]
    async fn oversized_image_is_clamped_and_reported() {
        let gateway = gateway_with(Arc::new(DryrunProvider));
        let raw = RawRequest {
            prompt: Some("a lighthouse".to_string()),
            model: Some("sdxl".to_string()),
            width: Some(2048),
            height: Some(512),
            ..RawRequest::default()
        };

        let result = gateway.handle(TaskKind::ImageGeneration, raw).await.unwrap();
        let envelope = result.to_envelope();
        assert!(envelope["image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(envelope["width"], json!(1024));
        assert_eq!(envelope["height"], json!(512));
        assert_eq!(envelope["warnings"], json!(["width 2048 clamped to 1024."]));
        assert_eq!(envelope["alias"], json!("sdxl"));
    }

    #[tokio::test]
    async fn exhausted_candidates_produce_failure_envelope() {
        let provider = FixedProvider::new(Err(ProviderFailure::http(404, "Model not found")));
        let gateway = gateway_with(provider.clone());
        let raw = RawRequest {
            prompt: Some("a fox".to_string()),
            ..RawRequest::default()
        };

        let err = gateway
            .handle(TaskKind::ImageGeneration, raw)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AllCandidatesFailed { .. }));
        let aliases = gateway.registry().aliases(TaskKind::ImageGeneration);
        assert_eq!(provider.calls.load(Ordering::SeqCst), aliases.len());

        let envelope = gateway.failure_envelope(TaskKind::ImageGeneration, &err);
        assert_eq!(envelope["success"], json!(false));
        assert!(envelope["error"]
            .as_str()
            .unwrap()
            .starts_with("All models failed. Last error:"));
        assert!(!envelope["hint"].as_str().unwrap().is_empty());
        assert_eq!(envelope["availableModels"], json!(aliases));
    }

    #[tokio::test]
    async fn task_policy_override_bounds_cold_start_retries() {
        let provider = FixedProvider::new(Err(ProviderFailure::http(
            503,
            r#"{"error":"Model is currently loading","estimated_time":1.0}"#,
        )));
        let clock = Arc::new(ManualClock::new());
        let mut providers = ProviderRegistry::new();
        providers.register_as("huggingface", provider.clone());
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::for_task(TaskKind::SpeechToText)
        };
        let gateway = Gateway::new(ModelRegistry::default(), providers, clock.clone())
            .unwrap()
            .with_policy(TaskKind::SpeechToText, policy);
        assert_eq!(gateway.policy(TaskKind::SpeechToText), policy);
        let raw = RawRequest {
            audio: Some("AAAA".to_string()),
            ..RawRequest::default()
        };

        let err = gateway
            .handle(TaskKind::SpeechToText, raw)
            .await
            .unwrap_err();
        let candidates = gateway.registry().aliases(TaskKind::SpeechToText).len();
        // Three calls per candidate, two one-second hinted sleeps between them.
        assert_eq!(provider.calls.load(Ordering::SeqCst), candidates * 3);
        assert_eq!(clock.total_slept(), Duration::from_secs(2 * candidates as u64));
        assert!(err.to_string().contains("gave up after 2 retries"));
    }

    #[tokio::test]
    async fn client_errors_never_reach_a_provider() {
        let provider = FixedProvider::new(Ok(ProviderReply::Text("unused".to_string())));
        let gateway = gateway_with(provider.clone());

        let err = gateway
            .handle(TaskKind::Chat, RawRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_provider_error_stops_after_one_call() {
        let provider = FixedProvider::new(Err(ProviderFailure::fatal("OPENROUTER_API_KEY is not set")));
        let gateway = gateway_with(provider.clone());
        let raw = RawRequest {
            messages: Some(vec![ChatMessage::new("user", "hi")]),
            ..RawRequest::default()
        };

        let err = gateway.handle(TaskKind::Chat, raw).await.unwrap_err();
        assert!(matches!(err, GatewayError::Fatal { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn image_url_is_downloaded_once_for_all_candidates() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = axum::Router::new().route(
            "/cat.png",
            axum::routing::get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { ([("content-type", "image/png")], vec![137u8, 80, 78, 71]) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = FixedProvider::new(Err(ProviderFailure::http(404, "Model not found")));
        let gateway = gateway_with(provider.clone())
            .with_image_fetcher(ImageFetcher::new(Duration::from_secs(5)).unwrap());
        let raw = RawRequest {
            image_url: Some(format!("http://{addr}/cat.png")),
            ..RawRequest::default()
        };

        let err = gateway.handle(TaskKind::VisionTask, raw).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllCandidatesFailed { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.abort();
    }

    #[tokio::test]
    async fn dryrun_config_serves_chat_offline() {
        let config = GatewayConfig {
            dryrun: true,
            ..GatewayConfig::default()
        };
        let gateway = Gateway::from_config(&config).unwrap();
        assert_eq!(gateway.provider_names(), vec!["dryrun", "huggingface", "openrouter"]);

        let raw = RawRequest {
            messages: Some(vec![ChatMessage::new("user", "ping")]),
            system_prompt: Some("be brief".to_string()),
            ..RawRequest::default()
        };
        let result = gateway.handle(TaskKind::Chat, raw).await.unwrap();
        let envelope = result.to_envelope();
        assert!(envelope["text"].as_str().unwrap().ends_with("] ping"));
        assert_eq!(envelope["provider"], json!("openrouter"));
    }

    #[tokio::test]
    async fn invocation_is_journaled_under_one_run_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let gateway = gateway_with(Arc::new(DryrunProvider))
            .with_events(atelier_contracts::events::EventWriter::new(&path, "gateway"));
        let raw = RawRequest {
            text: Some("read this aloud".to_string()),
            ..RawRequest::default()
        };
        gateway.handle(TaskKind::TextToSpeech, raw).await?;

        let rows: Vec<Value> = std::fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        let types: Vec<&str> = rows.iter().filter_map(|row| row["type"].as_str()).collect();
        assert_eq!(types, vec!["invocation_started", "attempt", "invocation_finished"]);
        assert!(rows.iter().all(|row| row["run_id"] == rows[0]["run_id"]));
        assert_ne!(rows[0]["run_id"], json!("gateway"));
        Ok(())
    }

    #[test]
    fn models_overview_marks_defaults() {
        let gateway = gateway_with(Arc::new(DryrunProvider));
        let overview = gateway.models_overview();
        let chat = &overview["tasks"]["chat"];
        let defaults: Vec<&Value> = chat["models"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|row| row["default"] == json!(true))
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0]["alias"], chat["default"]);
        assert!(defaults[0]["backendId"].as_str().is_some());
    }

    #[test]
    fn malformed_registry_is_rejected_at_construction() {
        let mut tables = indexmap::IndexMap::new();
        for (task, table) in ModelRegistry::default().tasks() {
            if *task != TaskKind::Chat {
                tables.insert(*task, table.clone());
            }
        }
        let result = Gateway::new(
            ModelRegistry::new(Some(tables)),
            ProviderRegistry::new(),
            Arc::new(ManualClock::new()),
        );
        assert!(result.is_err());
    }
}
