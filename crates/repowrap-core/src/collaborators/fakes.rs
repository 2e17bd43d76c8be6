//! Scripted in-memory collaborators (testing only)
//!
//! Every role answers from a queue of scripted results and falls back to a
//! fixed answer once the queue is empty. Calls are counted and requests are
//! kept so tests can assert on what the orchestrator sent.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::domain::{Capability, Diagnostic, Severity};

/// Collaborator role, used to address scripts, delays and hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Fetch,
    Analyze,
    Prepare,
    Generate,
    Validate,
    Repair,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Script<T> {
    queue: Mutex<VecDeque<CollaboratorResult<T>>>,
    fallback: Mutex<CollaboratorResult<T>>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: CollaboratorResult<T>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
        }
    }

    fn next(&self) -> CollaboratorResult<T> {
        if let Some(step) = self.queue.lock().unwrap().pop_front() {
            return step;
        }
        self.fallback.lock().unwrap().clone()
    }
}

/// Default file set produced by the fake generator.
pub fn sample_files() -> Vec<GeneratedFile> {
    vec![
        GeneratedFile {
            path: "server.py".into(),
            content: "from widget import api\n\ndef main():\n    api.serve()\n".into(),
        },
        GeneratedFile {
            path: "requirements.txt".into(),
            content: "widget\n".into(),
        },
    ]
}

/// Default analysis produced by the fake analyzer.
pub fn sample_analysis() -> AnalysisOutput {
    AnalysisOutput {
        capabilities: vec![Capability {
            name: "serve".into(),
            kind: "function".into(),
            module: Some("widget.api".into()),
            description: "start the widget API".into(),
        }],
        entry_points: vec!["widget.api:serve".into()],
        notes: None,
    }
}

/// A validation result with one error diagnostic.
pub fn diagnostics(message: &str) -> ValidationOutput {
    ValidationOutput {
        diagnostics: vec![Diagnostic {
            severity: Severity::Error,
            message: message.to_string(),
            file: Some("server.py".into()),
        }],
    }
}

/// Scripted implementation of every collaborator trait.
pub struct FakeCollaborators {
    fetch: Script<String>,
    analyze: Script<AnalysisOutput>,
    prepare: Script<EnvironmentDescriptor>,
    generate: Script<Vec<GeneratedFile>>,
    validate: Script<ValidationOutput>,
    repair: Script<RepairProposal>,
    calls: Mutex<HashMap<Role, u32>>,
    delays: Mutex<HashMap<Role, Duration>>,
    hooks: Mutex<HashMap<Role, Hook>>,
    generation_requests: Mutex<Vec<GenerationRequest>>,
    validation_requests: Mutex<Vec<ValidationRequest>>,
    repair_requests: Mutex<Vec<RepairRequest>>,
}

impl Default for FakeCollaborators {
    fn default() -> Self {
        Self::happy()
    }
}

impl FakeCollaborators {
    /// Every collaborator succeeds; validation is clean; repair has nothing.
    pub fn happy() -> Self {
        Self {
            fetch: Script::new(Ok("3f2a9c1e".to_string())),
            analyze: Script::new(Ok(sample_analysis())),
            prepare: Script::new(Ok(EnvironmentDescriptor {
                kind: "system".into(),
                exec_prefix: vec![],
                details: serde_json::json!({}),
            })),
            generate: Script::new(Ok(sample_files())),
            validate: Script::new(Ok(ValidationOutput {
                diagnostics: vec![],
            })),
            repair: Script::new(Ok(RepairProposal::NoPatch)),
            calls: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
            generation_requests: Mutex::new(Vec::new()),
            validation_requests: Mutex::new(Vec::new()),
            repair_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn into_collaborators(self) -> (Arc<Self>, Collaborators) {
        let fake = Arc::new(self);
        let collaborators = Collaborators::uniform(fake.clone());
        (fake, collaborators)
    }

    pub fn script_fetch(self, steps: Vec<CollaboratorResult<String>>) -> Self {
        self.fetch.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn script_analyze(self, steps: Vec<CollaboratorResult<AnalysisOutput>>) -> Self {
        self.analyze.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn script_prepare(self, steps: Vec<CollaboratorResult<EnvironmentDescriptor>>) -> Self {
        self.prepare.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn script_generate(self, steps: Vec<CollaboratorResult<Vec<GeneratedFile>>>) -> Self {
        self.generate.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn script_validate(self, steps: Vec<CollaboratorResult<ValidationOutput>>) -> Self {
        self.validate.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn script_repair(self, steps: Vec<CollaboratorResult<RepairProposal>>) -> Self {
        self.repair.queue.lock().unwrap().extend(steps);
        self
    }

    pub fn fallback_generate(self, result: CollaboratorResult<Vec<GeneratedFile>>) -> Self {
        *self.generate.fallback.lock().unwrap() = result;
        self
    }

    pub fn fallback_validate(self, result: CollaboratorResult<ValidationOutput>) -> Self {
        *self.validate.fallback.lock().unwrap() = result;
        self
    }

    pub fn fallback_repair(self, result: CollaboratorResult<RepairProposal>) -> Self {
        *self.repair.fallback.lock().unwrap() = result;
        self
    }

    pub fn fallback_fetch(self, result: CollaboratorResult<String>) -> Self {
        *self.fetch.fallback.lock().unwrap() = result;
        self
    }

    /// Sleep before every answer for `role`.
    pub fn with_delay(self, role: Role, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(role, delay);
        self
    }

    /// Run `hook` at the start of every call for `role`.
    pub fn on_call(self, role: Role, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.lock().unwrap().insert(role, Arc::new(hook));
        self
    }

    pub fn calls(&self, role: Role) -> u32 {
        self.calls.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    pub fn generation_requests(&self) -> Vec<GenerationRequest> {
        self.generation_requests.lock().unwrap().clone()
    }

    pub fn validation_requests(&self) -> Vec<ValidationRequest> {
        self.validation_requests.lock().unwrap().clone()
    }

    pub fn repair_requests(&self) -> Vec<RepairRequest> {
        self.repair_requests.lock().unwrap().clone()
    }

    async fn enter(&self, role: Role) {
        *self.calls.lock().unwrap().entry(role).or_insert(0) += 1;
        let hook = self.hooks.lock().unwrap().get(&role).cloned();
        if let Some(hook) = hook {
            hook();
        }
        let delay = self.delays.lock().unwrap().get(&role).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SourceFetcher for FakeCollaborators {
    async fn fetch(&self, _locator: &str, destination: &Path) -> CollaboratorResult<String> {
        self.enter(Role::Fetch).await;
        let commit = self.fetch.next()?;
        tokio::fs::write(destination.join("README.md"), "# widget\n")
            .await
            .map_err(|e| CollaboratorError::new(CollaboratorErrorKind::Spawn, e.to_string()))?;
        Ok(commit)
    }
}

#[async_trait]
impl Analyzer for FakeCollaborators {
    async fn analyze(&self, _snapshot: &WorkspaceSnapshot) -> CollaboratorResult<AnalysisOutput> {
        self.enter(Role::Analyze).await;
        self.analyze.next()
    }
}

#[async_trait]
impl EnvironmentPreparer for FakeCollaborators {
    async fn prepare(
        &self,
        _snapshot: &WorkspaceSnapshot,
    ) -> CollaboratorResult<EnvironmentDescriptor> {
        self.enter(Role::Prepare).await;
        self.prepare.next()
    }
}

#[async_trait]
impl Generator for FakeCollaborators {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<GeneratedFile>> {
        self.enter(Role::Generate).await;
        self.generation_requests.lock().unwrap().push(request.clone());
        self.generate.next()
    }
}

#[async_trait]
impl Validator for FakeCollaborators {
    async fn run_and_validate(
        &self,
        request: &ValidationRequest,
    ) -> CollaboratorResult<ValidationOutput> {
        self.enter(Role::Validate).await;
        self.validation_requests.lock().unwrap().push(request.clone());
        self.validate.next()
    }
}

#[async_trait]
impl RepairAdvisor for FakeCollaborators {
    async fn propose_repair(&self, request: &RepairRequest) -> CollaboratorResult<RepairProposal> {
        self.enter(Role::Repair).await;
        self.repair_requests.lock().unwrap().push(request.clone());
        self.repair.next()
    }
}
