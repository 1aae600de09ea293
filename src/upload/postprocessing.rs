//! # Post-processing Pipeline (C10)
//!
//! A small dependency-scheduled graph of named steps run after
//! [`super::engine::UploadEngine::finish`] materialises a node in
//! `processing` state (spec.md §4.10). Built-in steps: `initialize`,
//! `sleep`, `scanning`, `assembling`. The scheduler refuses cyclic
//! graphs; independent failing steps don't cancel independent siblings,
//! but a step whose dependency failed is itself skipped and recorded as
//! failed.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::events::{Event, EventSink, PostprocessingOutcome, PostprocessingStepFinished};
use crate::upload::engine::{FinishOutcome, UploadEngine};
use crate::upload::Session;

/// Result of an antivirus scan over a staging blob.
pub struct ScanReport {
    pub clean: bool,
    pub signature: Option<String>,
}

/// Scanner contract; the actual scanner implementation is an external
/// collaborator out of scope for this crate (spec.md §1).
#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, staged_path: &Path) -> AppResult<ScanReport>;
}

/// Always reports clean, for embedders with no scanner wired up.
pub struct NoopScanner;

#[async_trait]
impl VirusScanner for NoopScanner {
    async fn scan(&self, _staged_path: &Path) -> AppResult<ScanReport> {
        Ok(ScanReport {
            clean: true,
            signature: None,
        })
    }
}

/// What to do when [`VirusScanner::scan`] reports a finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPolicy {
    Delete,
    Keep,
    Error,
    Ignore,
}

/// One node in the dependency graph.
enum StepKind {
    Initialize,
    Sleep(Duration),
    Scanning {
        scanner: Arc<dyn VirusScanner>,
        policy: ScanPolicy,
    },
    Assembling,
}

struct StepSpec {
    name: String,
    depends_on: Vec<String>,
    kind: StepKind,
}

/// Builder for a pipeline run: add steps, declare which must finish
/// before the overall request is considered done, then [`Self::run`].
pub struct Pipeline {
    steps: Vec<StepSpec>,
    wait_for: Vec<String>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            wait_for: Vec::new(),
        }
    }

    pub fn initialize(mut self, name: &str) -> Self {
        self.steps.push(StepSpec {
            name: name.to_string(),
            depends_on: Vec::new(),
            kind: StepKind::Initialize,
        });
        self
    }

    pub fn sleep(mut self, name: &str, depends_on: &[&str], duration: Duration) -> Self {
        self.steps.push(StepSpec {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            kind: StepKind::Sleep(duration),
        });
        self
    }

    pub fn scanning(
        mut self,
        name: &str,
        depends_on: &[&str],
        scanner: Arc<dyn VirusScanner>,
        policy: ScanPolicy,
    ) -> Self {
        self.steps.push(StepSpec {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            kind: StepKind::Scanning { scanner, policy },
        });
        self
    }

    pub fn assembling(mut self, name: &str, depends_on: &[&str]) -> Self {
        self.steps.push(StepSpec {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            kind: StepKind::Assembling,
        });
        self
    }

    /// Steps that must complete before the pipeline is considered done
    /// for a synchronous caller (spec.md §4.10: synchronous uploads wait
    /// for `assembling`).
    pub fn wait_for(mut self, names: &[&str]) -> Self {
        self.wait_for = names.iter().map(|s| s.to_string()).collect();
        self
    }

    fn check_acyclic(&self) -> AppResult<()> {
        let names: HashSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a StepSpec>,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> AppResult<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(AppError::internal(format!(
                    "post-processing pipeline has a cycle through {name:?}"
                )));
            }
            if let Some(step) = by_name.get(name) {
                for dep in &step.depends_on {
                    visit(dep, by_name, visiting, done)?;
                }
            }
            visiting.remove(name);
            done.insert(name);
            Ok(())
        }

        let by_name: HashMap<&str, &StepSpec> = self.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        for name in &names {
            visit(name, &by_name, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    /// Runs every step to completion honoring dependencies, committing
    /// or reverting the engine's [`FinishOutcome`] based on the result,
    /// then invokes `finish` with the per-step error map and the
    /// session's cancellation state.
    pub async fn run(
        self,
        engine: &UploadEngine,
        session: &Session,
        outcome: FinishOutcome,
        sink: &dyn EventSink,
    ) -> AppResult<PostprocessingOutcome> {
        self.check_acyclic()?;

        let mut remaining: HashMap<String, StepSpec> =
            self.steps.into_iter().map(|s| (s.name.clone(), s)).collect();
        let mut results: HashMap<String, Result<(), String>> = HashMap::new();
        let mut scan_policy_triggered: Option<ScanPolicy> = None;

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, step)| step.depends_on.iter().all(|d| results.contains_key(d)))
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                for name in remaining.keys() {
                    results.insert(name.clone(), Err("unreachable dependency".to_string()));
                }
                break;
            }

            for name in ready {
                let step = remaining.remove(&name).unwrap();
                let blocked_by_failed_dep = step
                    .depends_on
                    .iter()
                    .any(|d| matches!(results.get(d), Some(Err(_))));

                let outcome_result = if blocked_by_failed_dep {
                    Err(format!("dependency failed for step {name}"))
                } else {
                    match run_step(&step.kind, session, engine, &outcome).await {
                        Ok(triggered) => {
                            if let Some(policy) = triggered {
                                scan_policy_triggered = Some(policy);
                            }
                            Ok(())
                        }
                        Err(e) => Err(e.to_string()),
                    }
                };

                sink.emit(Event::PostprocessingStepFinished(PostprocessingStepFinished {
                    upload_id: session.upload_id.clone(),
                    step_name: name.clone(),
                    succeeded: outcome_result.is_ok(),
                }))
                .await;

                results.insert(name, outcome_result);
            }
        }

        let error_map: HashMap<String, String> = results
            .into_iter()
            .filter_map(|(name, res)| res.err().map(|e| (name, e)))
            .collect();

        let pipeline_outcome = resolve_outcome(&error_map, scan_policy_triggered);
        finish(engine, session, &outcome, pipeline_outcome, session.cancelled).await?;
        Ok(pipeline_outcome)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes one step. Returns the triggered [`ScanPolicy`] when a
/// `scanning` step reports a finding, so the caller can fold it into the
/// overall outcome.
async fn run_step(
    kind: &StepKind,
    session: &Session,
    engine: &UploadEngine,
    outcome: &FinishOutcome,
) -> AppResult<Option<ScanPolicy>> {
    match kind {
        StepKind::Initialize => Ok(None),
        StepKind::Sleep(duration) => {
            tokio::time::sleep(*duration).await;
            Ok(None)
        }
        StepKind::Scanning { scanner, policy } => {
            let staged = session.bin_path(engine.root());
            let report = scanner.scan(&staged).await?;
            if report.clean {
                Ok(None)
            } else {
                match policy {
                    ScanPolicy::Ignore => Ok(None),
                    other => Ok(Some(*other)),
                }
            }
        }
        StepKind::Assembling => {
            engine.commit_blob(session, &outcome.node).await?;
            Ok(None)
        }
    }
}

/// `keep` maps to `Abort` rather than a distinct fourth outcome: the
/// infected bytes never become the node's live content either way, the
/// difference (spec.md's "keep bytes") is that the staging bin isn't
/// purged on an abort triggered while cancelled, leaving it around for
/// inspection.
fn resolve_outcome(
    error_map: &HashMap<String, String>,
    scan_policy_triggered: Option<ScanPolicy>,
) -> PostprocessingOutcome {
    match scan_policy_triggered {
        Some(ScanPolicy::Delete) => return PostprocessingOutcome::Delete,
        Some(ScanPolicy::Keep) | Some(ScanPolicy::Error) => return PostprocessingOutcome::Abort,
        Some(ScanPolicy::Ignore) | None => {}
    }
    if error_map.is_empty() {
        PostprocessingOutcome::Continue
    } else {
        PostprocessingOutcome::Abort
    }
}

/// Resolves the pipeline outcome against the engine. Per spec.md §4.10,
/// `Finish` removes the node for failures or cancellations, removes the
/// staging bin for non-cancellations, and always clears the
/// `processing` marker.
async fn finish(
    engine: &UploadEngine,
    session: &Session,
    outcome: &FinishOutcome,
    pipeline_outcome: PostprocessingOutcome,
    cancelled: bool,
) -> AppResult<()> {
    let effective = if cancelled && pipeline_outcome == PostprocessingOutcome::Continue {
        PostprocessingOutcome::Abort
    } else {
        pipeline_outcome
    };

    match effective {
        PostprocessingOutcome::Continue => {
            engine.clear_processing_marker(&outcome.node).await?;
        }
        PostprocessingOutcome::Abort | PostprocessingOutcome::Delete => match &outcome.revision_path {
            Some(revision) => {
                engine.discard_revision(&outcome.node, revision).await?;
                engine.clear_processing_marker(&outcome.node).await?;
            }
            None => engine.reject_created_node(&outcome.node).await?,
        },
    }

    if !cancelled {
        engine.sessions().purge(session).await?;
    }
    Ok(())
}
