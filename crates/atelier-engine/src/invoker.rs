use std::sync::Arc;
use std::time::Duration;

use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::models::{CapabilityLimits, ModelCandidate};
use atelier_contracts::outcome::{classify, AttemptOutcome, AttemptStatus};
use atelier_contracts::requests::{GenerationParams, InferenceRequest};
use atelier_contracts::retry::{Backoff, RetryPolicy};
use atelier_contracts::TaskKind;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::GatewayError;
use crate::providers::{ProviderCall, ProviderRegistry, ProviderReply};

/// The successful end of an invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub candidate: ModelCandidate,
    pub reply: ProviderReply,
    pub params: GenerationParams,
    pub attempts: Vec<AttemptOutcome>,
    pub warnings: Vec<String>,
}

/// Walks the candidate list strictly sequentially: retries the current
/// candidate on cold starts and rate limits, skips it on not-found or an
/// exhausted budget, and stops everything on a fatal error.
#[derive(Clone)]
pub struct RetryingInvoker {
    providers: ProviderRegistry,
    clock: Arc<dyn Clock>,
}

enum CandidateEnd {
    Served(ProviderReply),
    Abandoned { reason: &'static str, message: String },
    Fatal(String),
}

impl RetryingInvoker {
    pub fn new(providers: ProviderRegistry, clock: Arc<dyn Clock>) -> Self {
        Self { providers, clock }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub async fn invoke(
        &self,
        request: &InferenceRequest,
        candidates: &[ModelCandidate],
        policy: RetryPolicy,
        events: Option<&EventWriter>,
    ) -> Result<Invocation, GatewayError> {
        let mut attempts = Vec::new();
        let mut attempted = Vec::new();
        let mut last_error = "no candidates to try".to_string();

        for candidate in candidates {
            attempted.push(candidate.alias.clone());
            let (params, warnings) = clamp_params(&request.params, &candidate.limits);
            let end = self
                .run_candidate(request, candidate, params.clone(), policy, events, &mut attempts)
                .await;
            match end {
                CandidateEnd::Served(reply) => {
                    return Ok(Invocation {
                        candidate: candidate.clone(),
                        reply,
                        params,
                        attempts,
                        warnings,
                    });
                }
                CandidateEnd::Abandoned { reason, message } => {
                    warn!(
                        task = %request.task,
                        candidate = %candidate.alias,
                        reason,
                        error = %message,
                        "abandoning candidate"
                    );
                    emit(
                        events,
                        "candidate_abandoned",
                        json!({
                            "candidate": candidate.alias,
                            "backend_id": candidate.backend_id,
                            "reason": reason,
                            "error": message,
                        }),
                    );
                    last_error = format!("{}: {}", candidate.alias, message);
                }
                CandidateEnd::Fatal(message) => {
                    return Err(GatewayError::Fatal {
                        candidate: candidate.alias.clone(),
                        message,
                    });
                }
            }
        }

        Err(GatewayError::AllCandidatesFailed {
            last_error,
            attempted,
        })
    }

    async fn run_candidate(
        &self,
        request: &InferenceRequest,
        candidate: &ModelCandidate,
        params: GenerationParams,
        policy: RetryPolicy,
        events: Option<&EventWriter>,
        attempts: &mut Vec<AttemptOutcome>,
    ) -> CandidateEnd {
        let Some(provider) = self.providers.get(&candidate.provider) else {
            return CandidateEnd::Abandoned {
                reason: "unregistered-provider",
                message: format!("provider '{}' is not registered", candidate.provider),
            };
        };
        let call = ProviderCall {
            task: request.task,
            backend_id: &candidate.backend_id,
            payload: &request.payload,
            params,
        };

        let started = self.clock.now();
        let mut backoff = Backoff::new(policy);
        let mut trail = Trail {
            task: request.task,
            candidate,
            events,
            attempts,
        };
        let mut retries = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure = match provider.invoke(&call).await {
                Ok(reply) => {
                    trail.record(attempt, AttemptStatus::Success, None, None);
                    return CandidateEnd::Served(reply);
                }
                Err(failure) => failure,
            };
            let classified = classify(&failure);
            let message = failure.message;

            let kind = match classified.status.backoff_kind() {
                Some(kind) => kind,
                None if classified.status == AttemptStatus::NotFound => {
                    trail.record(attempt, AttemptStatus::NotFound, None, Some(&message));
                    return CandidateEnd::Abandoned {
                        reason: "not-found",
                        message,
                    };
                }
                None => {
                    trail.record(attempt, AttemptStatus::Fatal, None, Some(&message));
                    return CandidateEnd::Fatal(message);
                }
            };

            if retries >= policy.max_retries {
                trail.record(attempt, classified.status, None, Some(&message));
                return CandidateEnd::Abandoned {
                    reason: "timeout",
                    message: format!("gave up after {retries} retries: {message}"),
                };
            }
            let wait = backoff.next_wait(kind, classified.wait_hint);
            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed + wait > policy.total_budget {
                trail.record(attempt, classified.status, None, Some(&message));
                return CandidateEnd::Abandoned {
                    reason: "timeout",
                    message: format!(
                        "retry budget of {}s exhausted after {:.1}s: {message}",
                        policy.total_budget.as_secs(),
                        elapsed.as_secs_f64()
                    ),
                };
            }

            trail.record(attempt, classified.status, Some(wait), Some(&message));
            emit(
                events,
                "backoff",
                json!({
                    "candidate": candidate.alias,
                    "attempt": attempt,
                    "status": classified.status,
                    "wait_ms": wait.as_millis() as u64,
                    "elapsed_ms": elapsed.as_millis() as u64,
                }),
            );
            self.clock.sleep(wait).await;
            retries += 1;
        }
    }
}

/// Attempt bookkeeping for one candidate: log line, journal row, outcome list.
struct Trail<'a> {
    task: TaskKind,
    candidate: &'a ModelCandidate,
    events: Option<&'a EventWriter>,
    attempts: &'a mut Vec<AttemptOutcome>,
}

impl Trail<'_> {
    fn record(
        &mut self,
        attempt: u32,
        status: AttemptStatus,
        wait: Option<Duration>,
        message: Option<&str>,
    ) {
        let wait_ms = wait.map(|value| value.as_millis() as u64);
        info!(
            task = %self.task,
            candidate = %self.candidate.alias,
            backend_id = %self.candidate.backend_id,
            attempt,
            outcome = %status,
            wait_ms = wait_ms.unwrap_or(0),
            "inference attempt"
        );
        let outcome = AttemptOutcome {
            candidate: self.candidate.alias.clone(),
            backend_id: self.candidate.backend_id.clone(),
            attempt,
            status,
            wait_hint_ms: wait_ms,
            message: message.map(str::to_string),
        };
        emit(
            self.events,
            "attempt",
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );
        self.attempts.push(outcome);
    }
}

/// Clamps numeric parameters to the candidate's limits; returns one warning per clamp.
pub fn clamp_params(
    params: &GenerationParams,
    limits: &CapabilityLimits,
) -> (GenerationParams, Vec<String>) {
    let mut clamped = params.clone();
    let mut warnings = Vec::new();
    let mut clamp = |name: &str, value: &mut u32, limit: Option<u32>| {
        if let Some(limit) = limit {
            if *value > limit {
                warnings.push(format!("{name} {} clamped to {limit}.", *value));
                *value = limit;
            }
        }
    };
    clamp("width", &mut clamped.width, limits.max_width);
    clamp("height", &mut clamped.height, limits.max_height);
    clamp("maxTokens", &mut clamped.max_tokens, limits.max_tokens);
    (clamped, warnings)
}

pub(crate) fn emit(events: Option<&EventWriter>, event_type: &str, payload: Value) {
    let Some(events) = events else {
        return;
    };
    let payload: EventPayload = match payload {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    };
    if let Err(err) = events.emit(event_type, payload) {
        warn!(error = %err, event_type, "failed to write event journal");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use atelier_contracts::events::EventWriter;
    use atelier_contracts::models::{CapabilityLimits, ModelCandidate};
    use atelier_contracts::outcome::{parse_retry_after, AttemptStatus, ProviderFailure};
    use atelier_contracts::requests::{GenerationParams, InferenceRequest, Payload};
    use atelier_contracts::retry::RetryPolicy;
    use atelier_contracts::TaskKind;
    use serde_json::{json, Value};

    use super::{clamp_params, RetryingInvoker};
    use crate::clock::ManualClock;
    use crate::error::GatewayError;
    use crate::providers::{InferenceProvider, ProviderCall, ProviderRegistry, ProviderReply};

    type Script = VecDeque<Result<ProviderReply, ProviderFailure>>;

    /// Plays back scripted replies per backend id and records every call.
    #[derive(Clone, Default)]
    struct ScriptedProvider {
        scripts: Arc<Mutex<std::collections::HashMap<String, Script>>>,
        calls: Arc<Mutex<Vec<(String, GenerationParams)>>>,
    }

    impl ScriptedProvider {
        fn script(&self, backend_id: &str, replies: Vec<Result<ProviderReply, ProviderFailure>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(backend_id.to_string(), replies.into_iter().collect());
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((call.backend_id.to_string(), call.params.clone()));
            self.scripts
                .lock()
                .unwrap()
                .get_mut(call.backend_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(ProviderFailure::http(404, "unscripted")))
        }
    }

    fn candidate(alias: &str, limits: CapabilityLimits) -> ModelCandidate {
        ModelCandidate {
            alias: alias.to_string(),
            backend_id: format!("org/{alias}"),
            provider: "scripted".to_string(),
            limits,
            capabilities: Vec::new(),
        }
    }

    fn pair() -> Vec<ModelCandidate> {
        vec![
            candidate("a", CapabilityLimits::default()),
            candidate("b", CapabilityLimits::default()),
        ]
    }

    fn request(task: TaskKind) -> InferenceRequest {
        InferenceRequest {
            task,
            model_key: None,
            payload: Payload::Prompt {
                text: "hello".to_string(),
            },
            params: GenerationParams::default(),
        }
    }

    fn policy(initial_s: u64, max_s: u64, max_retries: u32, budget_s: u64) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(initial_s),
            max_delay: Duration::from_secs(max_s),
            max_retries,
            total_budget: Duration::from_secs(budget_s),
            ..RetryPolicy::for_task(TaskKind::TextGeneration)
        }
    }

    fn setup() -> (RetryingInvoker, ScriptedProvider, Arc<ManualClock>) {
        let provider = ScriptedProvider::default();
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let clock = Arc::new(ManualClock::new());
        (RetryingInvoker::new(registry, clock.clone()), provider, clock)
    }

    fn ok_text(text: &str) -> Result<ProviderReply, ProviderFailure> {
        Ok(ProviderReply::Text(text.to_string()))
    }

    fn loading(estimated_s: f64) -> Result<ProviderReply, ProviderFailure> {
        Err(ProviderFailure::http(
            503,
            json!({"error": "Model is currently loading", "estimated_time": estimated_s}).to_string(),
        ))
    }

    fn rate_limited() -> Result<ProviderReply, ProviderFailure> {
        Err(ProviderFailure::http(429, "Too Many Requests"))
    }

    #[tokio::test]
    async fn success_short_circuits_remaining_candidates() {
        let (invoker, provider, clock) = setup();
        provider.script("org/a", vec![ok_text("done")]);
        let candidates = pair();

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        assert_eq!(invocation.candidate.alias, "a");
        assert_eq!(invocation.reply, ProviderReply::Text("done".to_string()));
        assert_eq!(provider.calls(), vec!["org/a"]);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn not_found_advances_without_sleeping() {
        let (invoker, provider, clock) = setup();
        provider.script("org/a", vec![Err(ProviderFailure::http(404, "Not Found"))]);
        provider.script("org/b", vec![ok_text("from b")]);
        let candidates = pair();

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        assert_eq!(invocation.candidate.alias, "b");
        assert_eq!(provider.calls(), vec!["org/a", "org/b"]);
        assert!(clock.sleeps().is_empty());
        assert_eq!(invocation.attempts[0].status, AttemptStatus::NotFound);
        assert_eq!(invocation.attempts[0].wait_hint_ms, None);
    }

    #[tokio::test]
    async fn fatal_aborts_without_trying_other_candidates() {
        let (invoker, provider, clock) = setup();
        provider.script("org/a", vec![Err(ProviderFailure::http(401, "bad key"))]);
        provider.script("org/b", vec![ok_text("never")]);
        let candidates = pair();

        let err = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Fatal { ref candidate, .. } if candidate == "a"));
        assert_eq!(provider.calls(), vec!["org/a"]);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn cold_start_hints_are_slept_and_budget_is_enforced() {
        let (invoker, provider, clock) = setup();
        provider.script(
            "org/a",
            vec![loading(10.0), loading(20.0), loading(30.0), loading(40.0), loading(50.0), ok_text("late")],
        );
        provider.script("org/b", vec![ok_text("fallback")]);
        let candidates = pair();

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 60, 10, 100), None)
            .await
            .unwrap();

        // 10 + 20 + 30 + 40 = 100 fits the budget exactly; the 50s hint would exceed it.
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
                Duration::from_secs(40),
            ]
        );
        assert_eq!(invocation.candidate.alias, "b");
        assert_eq!(provider.calls(), vec!["org/a", "org/a", "org/a", "org/a", "org/a", "org/b"]);
    }

    #[tokio::test]
    async fn cold_start_hints_are_capped_at_max_delay() {
        let (invoker, provider, clock) = setup();
        provider.script("org/a", vec![loading(90.0), loading(5.0), ok_text("warm")]);
        let candidates = vec![candidate("a", CapabilityLimits::default())];

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        assert_eq!(invocation.candidate.alias, "a");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30), Duration::from_secs(5)]);
        assert_eq!(invocation.attempts.len(), 3);
        assert_eq!(invocation.attempts[0].wait_hint_ms, Some(30_000));
    }

    #[tokio::test]
    async fn absurd_provider_hints_are_capped_instead_of_failing() {
        let (invoker, provider, clock) = setup();
        let huge_retry_after = || -> Result<ProviderReply, ProviderFailure> {
            Err(ProviderFailure::http(429, "Too Many Requests")
                .with_retry_after(parse_retry_after("1e30")))
        };
        provider.script("org/a", vec![loading(1e30), huge_retry_after(), ok_text("warm")]);
        let candidates = vec![candidate("a", CapabilityLimits::default())];

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        assert_eq!(invocation.candidate.alias, "a");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30), Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn loading_without_hints_grows_by_one_and_a_half() {
        let (invoker, provider, clock) = setup();
        let bare_loading = || -> Result<ProviderReply, ProviderFailure> {
            Err(ProviderFailure::http(503, "Service Unavailable"))
        };
        provider.script("org/a", vec![bare_loading(), bare_loading(), bare_loading(), ok_text("ok")]);
        let candidates = vec![candidate("a", CapabilityLimits::default())];

        invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 60, 5, 300), None)
            .await
            .unwrap();
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(8), Duration::from_secs(12), Duration::from_secs(18)]
        );
    }

    #[tokio::test]
    async fn rate_limits_double_up_to_cap() {
        let (invoker, provider, clock) = setup();
        provider.script(
            "org/a",
            vec![rate_limited(), rate_limited(), rate_limited(), rate_limited(), rate_limited(), ok_text("ok")],
        );
        let candidates = vec![candidate("a", CapabilityLimits::default())];

        invoker
            .invoke(&request(TaskKind::ImageGeneration), &candidates, policy(10, 60, 8, 300), None)
            .await
            .unwrap();
        let secs: Vec<u64> = clock.sleeps().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![10, 20, 40, 60, 60]);
    }

    #[tokio::test]
    async fn max_retries_abandons_candidate() {
        let (invoker, provider, clock) = setup();
        provider.script("org/a", vec![rate_limited(), rate_limited(), rate_limited()]);
        let candidates = vec![candidate("a", CapabilityLimits::default())];

        let err = invoker
            .invoke(&request(TaskKind::Chat), &candidates, policy(1, 2, 2, 600), None)
            .await
            .unwrap_err();
        assert_eq!(clock.sleeps().len(), 2);
        match err {
            GatewayError::AllCandidatesFailed {
                last_error,
                attempted,
            } => {
                assert!(last_error.contains("gave up after 2 retries"));
                assert_eq!(attempted, vec!["a"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_carries_last_error() {
        let (invoker, provider, _clock) = setup();
        provider.script("org/a", vec![Err(ProviderFailure::http(404, "first missing"))]);
        provider.script("org/b", vec![Err(ProviderFailure::http(410, "second gone"))]);
        let candidates = pair();

        let err = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("All models failed"), "{text}");
        assert!(text.contains("second gone"), "{text}");
    }

    #[tokio::test]
    async fn parameters_are_clamped_per_candidate() {
        let (invoker, provider, _clock) = setup();
        provider.script("org/small", vec![Err(ProviderFailure::http(404, "gone"))]);
        provider.script("org/large", vec![ok_text("ok")]);
        let candidates = vec![
            candidate("small", CapabilityLimits::image(512)),
            candidate("large", CapabilityLimits::image(1024)),
        ];
        let mut request = request(TaskKind::ImageGeneration);
        request.params.width = 4096;
        request.params.height = 4096;

        let invocation = invoker
            .invoke(&request, &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        let sent: Vec<(u32, u32)> = provider
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, params)| (params.width, params.height))
            .collect();
        assert_eq!(sent, vec![(512, 512), (1024, 1024)]);
        assert_eq!((invocation.params.width, invocation.params.height), (1024, 1024));
        assert_eq!(
            invocation.warnings,
            vec!["width 4096 clamped to 1024.", "height 4096 clamped to 1024."]
        );
    }

    #[tokio::test]
    async fn unregistered_provider_is_skipped() {
        let (invoker, provider, _clock) = setup();
        provider.script("org/b", vec![ok_text("ok")]);
        let mut orphan = candidate("a", CapabilityLimits::default());
        orphan.provider = "missing".to_string();
        let candidates = vec![orphan, candidate("b", CapabilityLimits::default())];

        let invocation = invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), None)
            .await
            .unwrap();
        assert_eq!(invocation.candidate.alias, "b");
        assert_eq!(provider.calls(), vec!["org/b"]);
    }

    #[tokio::test]
    async fn attempts_are_journaled() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let events = EventWriter::new(&path, "run-1");
        let (invoker, provider, _clock) = setup();
        provider.script("org/a", vec![loading(2.0), Err(ProviderFailure::http(404, "gone"))]);
        provider.script("org/b", vec![ok_text("ok")]);
        let candidates = pair();

        invoker
            .invoke(&request(TaskKind::TextGeneration), &candidates, policy(8, 30, 5, 120), Some(&events))
            .await?;

        let types: Vec<String> = std::fs::read_to_string(&path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec!["attempt", "backoff", "attempt", "candidate_abandoned", "attempt"]
        );
        Ok(())
    }

    #[test]
    fn clamp_leaves_values_within_limits() {
        let params = GenerationParams {
            max_tokens: 2000,
            ..GenerationParams::default()
        };
        let (clamped, warnings) = clamp_params(&params, &CapabilityLimits::tokens(1024));
        assert_eq!(clamped.max_tokens, 1024);
        assert_eq!(clamped.width, params.width);
        assert_eq!(warnings, vec!["maxTokens 2000 clamped to 1024."]);
    }
}
