use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::engines::{EngineKind, CRAIYON, HORDE, HUGGINGFACE};
use easel_contracts::events::{EventLog, EventPayload};
use easel_contracts::outcome::{GeneratedImage, GenerationFailure, ImageRef};
use easel_contracts::session::{Session, SessionStore, UserId};
use image::{Rgb, RgbImage};
use indexmap::IndexMap;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const MIN_PROMPT_CHARS: usize = 5;

const CLIENT_AGENT: &str = "easel:0.1:https://github.com/easel";

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    pub out_dir: PathBuf,
}

/// Uniform capability over the closed engine set. Every failure mode is
/// converted to a typed result before it crosses this boundary.
pub trait GenerationEngine: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure>;
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: IndexMap<String, Box<dyn GenerationEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: GenerationEngine + 'static>(&mut self, engine: E) {
        self.engines
            .insert(engine.name().to_string(), Box::new(engine));
    }

    pub fn get(&self, name: &str) -> Option<&dyn GenerationEngine> {
        self.engines.get(name).map(|engine| engine.as_ref())
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }
}

/// The live backends.
pub fn default_engine_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register(HordeEngine::new());
    registry.register(CraiyonEngine::new());
    registry.register(HuggingfaceEngine::new());
    registry
}

/// Dryrun stand-ins registered under the live names, so engine selection
/// and the fallback wiring behave identically with no network.
pub fn offline_engine_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register(DryrunEngine::named(HORDE));
    registry.register(DryrunEngine::named(CRAIYON));
    registry.register(DryrunEngine::named(HUGGINGFACE));
    registry
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
    Failed,
    TimedOut,
}

/// One in-flight asynchronous generation request. Lives only for the
/// duration of a single poll loop.
#[derive(Debug)]
pub struct GenerationJob {
    pub job_id: String,
    pub submitted_at: Instant,
    pub status: JobStatus,
}

impl GenerationJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Instant::now(),
            status: JobStatus::Pending,
        }
    }
}

/// What one status query observed. Callers map transport errors to
/// `Pending`: a probe that cannot be read is indistinguishable from a job
/// that is not done yet, bounded only by the poll budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollProbe {
    Done(Vec<String>),
    Pending,
    Faulted(String),
}

/// Fixed-interval poll loop with a deadline measured from job submission,
/// not from the first probe.
#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    interval: Duration,
    budget: Duration,
}

impl JobPoller {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_BUDGET: Duration = Duration::from_secs(120);

    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }

    pub fn wait(
        &self,
        job: &mut GenerationJob,
        mut probe: impl FnMut() -> PollProbe,
    ) -> Result<String, GenerationFailure> {
        let deadline = job.submitted_at + self.budget;
        loop {
            match probe() {
                PollProbe::Done(refs) => {
                    // Completion without a payload is not completion yet.
                    if let Some(first) = refs.into_iter().next() {
                        job.status = JobStatus::Done;
                        return Ok(first);
                    }
                }
                PollProbe::Faulted(reason) => {
                    job.status = JobStatus::Failed;
                    return Err(GenerationFailure::Generation(reason));
                }
                PollProbe::Pending => {}
            }
            if Instant::now() >= deadline {
                job.status = JobStatus::TimedOut;
                return Err(GenerationFailure::PollTimeout {
                    budget_secs: self.budget.as_secs(),
                });
            }
            thread::sleep(self.interval);
        }
    }
}

impl Default for JobPoller {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_BUDGET)
    }
}

pub struct HordeEngine {
    api_base: String,
    api_key: String,
    http: HttpClient,
    poller: JobPoller,
}

impl HordeEngine {
    pub fn new() -> Self {
        Self {
            api_base: non_empty_env("HORDE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://stablehorde.net/api/v2".to_string()),
            // The all-zero key is the documented anonymous tier.
            api_key: non_empty_env("HORDE_API_KEY").unwrap_or_else(|| "0000000000".to_string()),
            http: HttpClient::new(),
            poller: JobPoller::default(),
        }
    }

    fn submit(&self, prompt: &str) -> Result<GenerationJob, GenerationFailure> {
        let payload = json!({
            "prompt": prompt,
            "params": {
                "sampler_name": "k_euler",
                "width": 512,
                "height": 512,
                "steps": 20,
            },
            "nsfw": false,
        });
        let response = self
            .http
            .post(format!("{}/generate/async", self.api_base))
            .header("apikey", &self.api_key)
            .header("Client-Agent", CLIENT_AGENT)
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .map_err(|err| GenerationFailure::Submission(err.to_string()))?;

        let code = response.status().as_u16();
        if !matches!(code, 200 | 202) {
            let body = response.text().unwrap_or_default();
            return Err(GenerationFailure::Submission(format!(
                "status {code}: {}",
                truncate_text(&body, 256)
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|err| GenerationFailure::Submission(format!("invalid submit payload: {err}")))?;
        let job_id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| GenerationFailure::Submission("submit response missing job id".to_string()))?;
        Ok(GenerationJob::new(job_id))
    }

    fn probe_status(&self, job_id: &str) -> PollProbe {
        let response = match self
            .http
            .get(format!("{}/generate/status/{}", self.api_base, job_id))
            .header("apikey", &self.api_key)
            .header("Client-Agent", CLIENT_AGENT)
            .timeout(Duration::from_secs(30))
            .send()
        {
            Ok(response) => response,
            Err(_) => return PollProbe::Pending,
        };
        let payload: Value = match response.json() {
            Ok(payload) => payload,
            Err(_) => return PollProbe::Pending,
        };
        probe_from_status(&payload)
    }
}

impl Default for HordeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEngine for HordeEngine {
    fn name(&self) -> &str {
        HORDE
    }

    fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
        let mut job = self.submit(&request.prompt)?;
        let job_id = job.job_id.clone();
        let url = self.poller.wait(&mut job, || self.probe_status(&job_id))?;
        Ok(ImageRef::Url(url))
    }
}

fn probe_from_status(payload: &Value) -> PollProbe {
    if payload
        .get("faulted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return PollProbe::Faulted("job marked faulted by the backend".to_string());
    }
    if payload.get("done").and_then(Value::as_bool).unwrap_or(false) {
        let refs = payload
            .get("generations")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("img").and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();
        return PollProbe::Done(refs);
    }
    PollProbe::Pending
}

pub struct CraiyonEngine {
    api_base: String,
    http: HttpClient,
}

impl CraiyonEngine {
    pub fn new() -> Self {
        Self {
            api_base: non_empty_env("CRAIYON_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.craiyon.com/v3".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for CraiyonEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEngine for CraiyonEngine {
    fn name(&self) -> &str {
        CRAIYON
    }

    fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
        let response = self
            .http
            .post(&self.api_base)
            .timeout(Duration::from_secs(90))
            .json(&json!({ "prompt": request.prompt }))
            .send()
            .map_err(|err| GenerationFailure::Generation(err.to_string()))?;

        let code = response.status().as_u16();
        if code != 200 {
            let body = response.text().unwrap_or_default();
            return Err(GenerationFailure::Generation(format!(
                "status {code}: {}",
                truncate_text(&body, 256)
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|err| GenerationFailure::Generation(format!("invalid payload: {err}")))?;
        let bytes = decode_first_image(&payload)?;

        std::fs::create_dir_all(&request.out_dir)
            .map_err(|err| GenerationFailure::Generation(err.to_string()))?;
        let path = request.out_dir.join(format!(
            "craiyon-{}-{}.jpg",
            timestamp_millis(),
            artifact_suffix()
        ));
        std::fs::write(&path, bytes)
            .map_err(|err| GenerationFailure::Generation(format!("write failed: {err}")))?;
        Ok(ImageRef::File(path))
    }
}

fn decode_first_image(payload: &Value) -> Result<Vec<u8>, GenerationFailure> {
    let first = payload
        .get("images")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GenerationFailure::Generation("response carried no images".to_string()))?;
    BASE64
        .decode(first.as_bytes())
        .map_err(|err| GenerationFailure::Generation(format!("image base64 decode failed: {err}")))
}

pub struct HuggingfaceEngine {
    space_base: String,
    http: HttpClient,
}

const HF_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted";
const HF_GUIDANCE_SCALE: u64 = 9;

impl HuggingfaceEngine {
    pub fn new() -> Self {
        Self {
            space_base: non_empty_env("HF_SPACE_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://stabilityai-stable-diffusion.hf.space".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for HuggingfaceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEngine for HuggingfaceEngine {
    fn name(&self) -> &str {
        HUGGINGFACE
    }

    fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
        let response = self
            .http
            .post(format!("{}/run/infer", self.space_base))
            .timeout(Duration::from_secs(120))
            .json(&json!({
                "data": [request.prompt, HF_NEGATIVE_PROMPT, HF_GUIDANCE_SCALE],
            }))
            .send()
            .map_err(|err| GenerationFailure::Generation(err.to_string()))?;

        let code = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerationFailure::Generation(format!(
                "status {code}: {}",
                truncate_text(&body, 256)
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|err| GenerationFailure::Generation(format!("invalid payload: {err}")))?;

        let mut refs = Vec::new();
        extract_image_refs(payload.get("data").unwrap_or(&Value::Null), &mut refs);
        let first = refs
            .into_iter()
            .next()
            .ok_or_else(|| GenerationFailure::Generation("response carried no image references".to_string()))?;
        Ok(ImageRef::Url(resolve_space_ref(&self.space_base, &first)))
    }
}

fn extract_image_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(reference) => {
            let trimmed = reference.trim();
            if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_image_refs(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["image", "url", "name", "data"] {
                if let Some(inner) = obj.get(key) {
                    extract_image_refs(inner, out);
                }
            }
        }
        _ => {}
    }
}

fn resolve_space_ref(space_base: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    // Gradio serves local handles through its file endpoint.
    format!("{}/file={}", space_base, reference.trim_start_matches('/'))
}

/// Writes a prompt-colored placeholder so the chat flow runs with no
/// network or credentials.
pub struct DryrunEngine {
    name: String,
}

impl DryrunEngine {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl GenerationEngine for DryrunEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
        std::fs::create_dir_all(&request.out_dir)
            .map_err(|err| GenerationFailure::Generation(err.to_string()))?;
        let path = request.out_dir.join(format!(
            "dryrun-{}-{}.png",
            timestamp_millis(),
            artifact_suffix()
        ));
        write_placeholder_image(&path, 512, 512, &request.prompt)
            .map_err(|err| GenerationFailure::Generation(err.to_string()))?;
        Ok(ImageRef::File(path))
    }
}

fn write_placeholder_image(path: &Path, width: u32, height: u32, prompt: &str) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width, height);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    canvas
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut acc: [u8; 3] = [0x5e, 0x81, 0xac];
    for (idx, byte) in prompt.bytes().enumerate() {
        acc[idx % 3] = acc[idx % 3].wrapping_mul(31).wrapping_add(byte);
    }
    (acc[0], acc[1], acc[2])
}

/// Routes one chat prompt to the user's selected engine, applies the
/// single-attempt fallback, and records the request lifecycle in the
/// event log.
pub struct Orchestrator {
    out_dir: PathBuf,
    sessions: SessionStore,
    engines: EngineRegistry,
    events: EventLog,
}

impl Orchestrator {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        engines: EngineRegistry,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        let events = EventLog::new(events_path.into());
        events.emit(
            "orchestrator_started",
            payload_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
                "engines": engines.names(),
            })),
        )?;
        Ok(Self {
            out_dir,
            sessions: SessionStore::new(),
            engines,
            events,
        })
    }

    pub fn session(&self, user: UserId) -> Option<Session> {
        self.sessions.get(user)
    }

    pub fn start(&self, user: UserId) -> Session {
        let session = self.sessions.get_or_create(user);
        self.emit(
            "session_started",
            payload_object(json!({
                "user_id": user,
                "engine": session.engine.as_str(),
            })),
        );
        session
    }

    pub fn select_engine(&self, user: UserId, engine: EngineKind) {
        self.sessions.set_engine(user, engine);
        self.emit(
            "engine_selected",
            payload_object(json!({
                "user_id": user,
                "engine": engine.as_str(),
            })),
        );
    }

    pub fn reset(&self, user: UserId) {
        self.sessions.reset(user);
        self.emit(
            "session_reset",
            payload_object(json!({ "user_id": user })),
        );
    }

    pub fn generate(
        &self,
        user: UserId,
        prompt: &str,
    ) -> Result<GeneratedImage, GenerationFailure> {
        let trimmed = prompt.trim();
        if trimmed.chars().count() < MIN_PROMPT_CHARS {
            self.emit(
                "prompt_rejected",
                payload_object(json!({
                    "user_id": user,
                    "length": trimmed.chars().count(),
                })),
            );
            return Err(GenerationFailure::InvalidPrompt);
        }

        // Stored before dispatch: a failed generation must still be
        // regenerable.
        self.sessions.set_last_prompt(user, trimmed);
        let selected = self.sessions.get_or_create(user).engine;

        let request = EngineRequest {
            prompt: trimmed.to_string(),
            out_dir: self.out_dir.clone(),
        };
        let primary = selected.as_str();
        self.emit(
            "generation_started",
            payload_object(json!({
                "user_id": user,
                "engine": primary,
                "prompt": trimmed,
            })),
        );

        let failure = match self.dispatch(primary, &request) {
            Ok(image) => return Ok(self.finish(user, primary, image)),
            Err(failure) => failure,
        };

        let Some(fallback) = selected.fallback() else {
            self.emit_failed(user, primary, &failure);
            return Err(failure);
        };

        self.emit(
            "engine_fallback",
            payload_object(json!({
                "user_id": user,
                "from": primary,
                "to": fallback,
                "reason": failure.kind(),
                "detail": failure.to_string(),
            })),
        );
        match self.dispatch(fallback, &request) {
            Ok(image) => Ok(self.finish(user, fallback, image)),
            Err(final_failure) => {
                self.emit_failed(user, fallback, &final_failure);
                Err(final_failure)
            }
        }
    }

    pub fn regenerate(&self, user: UserId) -> Result<GeneratedImage, GenerationFailure> {
        let prompt = self
            .sessions
            .get(user)
            .and_then(|session| session.last_prompt)
            .ok_or(GenerationFailure::NoPriorPrompt)?;
        self.generate(user, &prompt)
    }

    fn dispatch(&self, name: &str, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
        let Some(engine) = self.engines.get(name) else {
            return Err(GenerationFailure::Generation(format!(
                "engine '{name}' not registered"
            )));
        };
        engine.generate(request)
    }

    fn finish(&self, user: UserId, engine: &str, image: ImageRef) -> GeneratedImage {
        self.emit(
            "image_ready",
            payload_object(json!({
                "user_id": user,
                "engine": engine,
                "image": image.describe(),
            })),
        );
        GeneratedImage {
            engine: engine.to_string(),
            image,
        }
    }

    fn emit_failed(&self, user: UserId, engine: &str, failure: &GenerationFailure) {
        self.emit(
            "generation_failed",
            payload_object(json!({
                "user_id": user,
                "engine": engine,
                "reason": failure.kind(),
                "detail": failure.to_string(),
            })),
        );
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            eprintln!("easel: event write failed: {err:#}");
        }
    }
}

fn payload_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn artifact_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    struct ScriptedEngine {
        name: String,
        outcome: Result<ImageRef, GenerationFailure>,
        calls: Arc<AtomicUsize>,
        last_prompt: Arc<Mutex<Option<String>>>,
    }

    impl ScriptedEngine {
        fn new(name: &str, outcome: Result<ImageRef, GenerationFailure>) -> Self {
            Self {
                name: name.to_string(),
                outcome,
                calls: Arc::new(AtomicUsize::new(0)),
                last_prompt: Arc::new(Mutex::new(None)),
            }
        }

        fn calls(&self) -> Arc<AtomicUsize> {
            self.calls.clone()
        }

        fn prompts(&self) -> Arc<Mutex<Option<String>>> {
            self.last_prompt.clone()
        }
    }

    impl GenerationEngine for ScriptedEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn generate(&self, request: &EngineRequest) -> Result<ImageRef, GenerationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(request.prompt.clone());
            self.outcome.clone()
        }
    }

    fn url(reference: &str) -> ImageRef {
        ImageRef::Url(reference.to_string())
    }

    fn orchestrator_with(
        temp: &tempfile::TempDir,
        engines: EngineRegistry,
    ) -> anyhow::Result<Orchestrator> {
        let run_dir = temp.path().join("run");
        let events_path = run_dir.join("events.jsonl");
        Orchestrator::new(&run_dir, &events_path, engines)
    }

    fn event_types(temp: &tempfile::TempDir) -> Vec<String> {
        let raw = std::fs::read_to_string(temp.path().join("run").join("events.jsonl"))
            .unwrap_or_default();
        raw.lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn short_prompt_is_rejected_without_touching_the_session() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engines = EngineRegistry::new();
        engines.register(ScriptedEngine::new(
            HORDE,
            Err(GenerationFailure::Generation("must not run".to_string())),
        ));
        let orchestrator = orchestrator_with(&temp, engines)?;

        let result = orchestrator.generate(7, "  fox  ");
        assert_eq!(result.unwrap_err(), GenerationFailure::InvalidPrompt);
        assert!(orchestrator.session(7).is_none());
        assert!(event_types(&temp).contains(&"prompt_rejected".to_string()));
        Ok(())
    }

    #[test]
    fn generation_defaults_to_horde_and_tags_the_producer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let horde = ScriptedEngine::new(HORDE, Ok(url("https://img.example/fox.png")));
        let calls = horde.calls();
        let mut engines = EngineRegistry::new();
        engines.register(horde);
        let orchestrator = orchestrator_with(&temp, engines)?;

        let image = orchestrator.generate(7, "a red fox in snow").unwrap();
        assert_eq!(image.engine, HORDE);
        assert_eq!(image.image, url("https://img.example/fox.png"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            orchestrator.session(7).unwrap().last_prompt.as_deref(),
            Some("a red fox in snow")
        );
        Ok(())
    }

    #[test]
    fn submission_failure_falls_back_to_craiyon_exactly_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let horde = ScriptedEngine::new(
            HORDE,
            Err(GenerationFailure::Submission("status 500".to_string())),
        );
        let craiyon = ScriptedEngine::new(CRAIYON, Ok(ImageRef::File("/tmp/c.jpg".into())));
        let craiyon_calls = craiyon.calls();
        let mut engines = EngineRegistry::new();
        engines.register(horde);
        engines.register(craiyon);
        let orchestrator = orchestrator_with(&temp, engines)?;

        let image = orchestrator.generate(7, "a red fox in snow").unwrap();
        assert_eq!(image.engine, CRAIYON);
        assert_eq!(craiyon_calls.load(Ordering::SeqCst), 1);

        let types = event_types(&temp);
        let started = types.iter().position(|t| t == "generation_started").unwrap();
        let fallback = types.iter().position(|t| t == "engine_fallback").unwrap();
        let ready = types.iter().position(|t| t == "image_ready").unwrap();
        assert!(started < fallback && fallback < ready);
        Ok(())
    }

    #[test]
    fn poll_timeout_also_triggers_the_fallback() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let horde = ScriptedEngine::new(
            HORDE,
            Err(GenerationFailure::PollTimeout { budget_secs: 120 }),
        );
        let craiyon = ScriptedEngine::new(CRAIYON, Ok(ImageRef::File("/tmp/c.jpg".into())));
        let mut engines = EngineRegistry::new();
        engines.register(horde);
        engines.register(craiyon);
        let orchestrator = orchestrator_with(&temp, engines)?;

        let image = orchestrator.generate(7, "a red fox in snow").unwrap();
        assert_eq!(image.engine, CRAIYON);
        Ok(())
    }

    #[test]
    fn fallback_failure_is_final_and_never_retried() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let horde = ScriptedEngine::new(
            HORDE,
            Err(GenerationFailure::Submission("status 500".to_string())),
        );
        let craiyon = ScriptedEngine::new(
            CRAIYON,
            Err(GenerationFailure::Generation("decode failed".to_string())),
        );
        let horde_calls = horde.calls();
        let craiyon_calls = craiyon.calls();
        let mut engines = EngineRegistry::new();
        engines.register(horde);
        engines.register(craiyon);
        let orchestrator = orchestrator_with(&temp, engines)?;

        let failure = orchestrator.generate(7, "a red fox in snow").unwrap_err();
        assert_eq!(
            failure,
            GenerationFailure::Generation("decode failed".to_string())
        );
        assert_eq!(horde_calls.load(Ordering::SeqCst), 1);
        assert_eq!(craiyon_calls.load(Ordering::SeqCst), 1);
        // The prompt must survive a failed attempt for /regen.
        assert_eq!(
            orchestrator.session(7).unwrap().last_prompt.as_deref(),
            Some("a red fox in snow")
        );
        Ok(())
    }

    #[test]
    fn huggingface_has_no_fallback() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let huggingface = ScriptedEngine::new(
            HUGGINGFACE,
            Err(GenerationFailure::Generation("delegate failed".to_string())),
        );
        let craiyon = ScriptedEngine::new(CRAIYON, Ok(ImageRef::File("/tmp/c.jpg".into())));
        let craiyon_calls = craiyon.calls();
        let mut engines = EngineRegistry::new();
        engines.register(huggingface);
        engines.register(craiyon);
        let orchestrator = orchestrator_with(&temp, engines)?;

        orchestrator.select_engine(7, EngineKind::Huggingface);
        let failure = orchestrator.generate(7, "a red fox in snow").unwrap_err();
        assert_eq!(
            failure,
            GenerationFailure::Generation("delegate failed".to_string())
        );
        assert_eq!(craiyon_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn regenerate_replays_the_stored_prompt_through_the_same_flow() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let horde = ScriptedEngine::new(HORDE, Ok(url("https://img.example/fox.png")));
        let calls = horde.calls();
        let prompts = horde.prompts();
        let mut engines = EngineRegistry::new();
        engines.register(horde);
        let orchestrator = orchestrator_with(&temp, engines)?;

        orchestrator.generate(7, "a red fox in snow").unwrap();
        let again = orchestrator.regenerate(7).unwrap();
        assert_eq!(again.engine, HORDE);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            prompts.lock().unwrap().as_deref(),
            Some("a red fox in snow")
        );
        Ok(())
    }

    #[test]
    fn regenerate_without_history_reports_no_prior_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let orchestrator = orchestrator_with(&temp, EngineRegistry::new())?;
        assert_eq!(
            orchestrator.regenerate(7).unwrap_err(),
            GenerationFailure::NoPriorPrompt
        );

        orchestrator.start(7);
        assert_eq!(
            orchestrator.regenerate(7).unwrap_err(),
            GenerationFailure::NoPriorPrompt
        );
        Ok(())
    }

    #[test]
    fn reset_clears_the_session_for_a_fresh_default() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let orchestrator = orchestrator_with(&temp, EngineRegistry::new())?;
        orchestrator.select_engine(7, EngineKind::Huggingface);
        orchestrator.reset(7);
        assert!(orchestrator.session(7).is_none());

        let fresh = orchestrator.start(7);
        assert_eq!(fresh.engine, EngineKind::Horde);
        assert!(fresh.last_prompt.is_none());
        Ok(())
    }

    #[test]
    fn poller_returns_the_first_image_on_completion() {
        let poller = JobPoller::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut job = GenerationJob::new("abc123");
        let mut polls = 0;
        let result = poller.wait(&mut job, || {
            polls += 1;
            if polls < 3 {
                PollProbe::Pending
            } else {
                PollProbe::Done(vec!["https://img.example/1.png".to_string()])
            }
        });
        assert_eq!(result.unwrap(), "https://img.example/1.png");
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(polls, 3);
    }

    #[test]
    fn poller_times_out_when_the_job_never_completes() {
        let poller = JobPoller::new(Duration::from_millis(1), Duration::from_millis(20));
        let mut job = GenerationJob::new("abc123");
        let result = poller.wait(&mut job, || PollProbe::Pending);
        assert!(matches!(
            result.unwrap_err(),
            GenerationFailure::PollTimeout { .. }
        ));
        assert_eq!(job.status, JobStatus::TimedOut);
    }

    #[test]
    fn poller_treats_completion_without_payload_as_pending() {
        let poller = JobPoller::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut job = GenerationJob::new("abc123");
        let mut polls = 0;
        let result = poller.wait(&mut job, || {
            polls += 1;
            if polls == 1 {
                PollProbe::Done(Vec::new())
            } else {
                PollProbe::Done(vec!["https://img.example/2.png".to_string()])
            }
        });
        assert_eq!(result.unwrap(), "https://img.example/2.png");
        assert_eq!(polls, 2);
    }

    #[test]
    fn poller_stops_immediately_on_an_explicit_fault() {
        let poller = JobPoller::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut job = GenerationJob::new("abc123");
        let mut polls = 0;
        let result = poller.wait(&mut job, || {
            polls += 1;
            PollProbe::Faulted("job marked faulted by the backend".to_string())
        });
        assert!(matches!(
            result.unwrap_err(),
            GenerationFailure::Generation(_)
        ));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(polls, 1);
    }

    #[test]
    fn status_payloads_map_to_probes() {
        let pending = json!({ "done": false, "generations": [] });
        assert_eq!(probe_from_status(&pending), PollProbe::Pending);

        let done = json!({
            "done": true,
            "generations": [{ "img": "https://img.example/1.png" }],
        });
        assert_eq!(
            probe_from_status(&done),
            PollProbe::Done(vec!["https://img.example/1.png".to_string()])
        );

        let done_empty = json!({ "done": true });
        assert_eq!(probe_from_status(&done_empty), PollProbe::Done(Vec::new()));

        let faulted = json!({ "faulted": true, "done": false });
        assert!(matches!(probe_from_status(&faulted), PollProbe::Faulted(_)));
    }

    #[test]
    fn craiyon_payload_decodes_the_first_image() {
        let payload = json!({ "images": ["aGVsbG8="] });
        assert_eq!(decode_first_image(&payload).unwrap(), b"hello");

        let bad = json!({ "images": ["not base64!!"] });
        assert!(matches!(
            decode_first_image(&bad).unwrap_err(),
            GenerationFailure::Generation(_)
        ));

        let empty = json!({ "images": [] });
        assert!(matches!(
            decode_first_image(&empty).unwrap_err(),
            GenerationFailure::Generation(_)
        ));
    }

    #[test]
    fn space_response_walker_finds_nested_references() {
        let payload = json!([
            [
                { "image": "https://space.example/a.png" },
                { "image": "https://space.example/a.png" },
                { "name": "tmp/b.png" },
            ]
        ]);
        let mut refs = Vec::new();
        extract_image_refs(&payload, &mut refs);
        assert_eq!(refs, vec!["https://space.example/a.png", "tmp/b.png"]);
    }

    #[test]
    fn space_refs_resolve_against_the_file_endpoint() {
        let base = "https://space.example";
        assert_eq!(
            resolve_space_ref(base, "https://cdn.example/a.png"),
            "https://cdn.example/a.png"
        );
        assert_eq!(
            resolve_space_ref(base, "/tmp/b.png"),
            "https://space.example/file=tmp/b.png"
        );
    }

    #[test]
    fn registry_preserves_registration_order() {
        let registry = default_engine_registry();
        assert_eq!(registry.names(), vec![HORDE, CRAIYON, HUGGINGFACE]);
        assert!(registry.get(CRAIYON).is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn offline_registry_answers_to_the_live_names() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = offline_engine_registry();
        let request = EngineRequest {
            prompt: "a red fox in snow".to_string(),
            out_dir: temp.path().to_path_buf(),
        };
        let image = registry.get(HORDE).unwrap().generate(&request).unwrap();
        let ImageRef::File(path) = image else {
            panic!("dryrun engines write files");
        };
        let decoded = image::open(&path)?;
        assert_eq!(decoded.width(), 512);
        assert_eq!(decoded.height(), 512);
        Ok(())
    }
}
