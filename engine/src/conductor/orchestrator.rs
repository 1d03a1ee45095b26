//! Task orchestrator
//!
//! Drives one task through its lifecycle:
//!
//! ```text
//! Pending -> Planning -> PlanFailed
//!                     -> Executing -> Completed | PartiallyCompleted
//! (any live state) -> Aborted        on a failed history write
//! ```
//!
//! Steps run strictly one at a time in plan order. A step whose dependency
//! did not succeed is skipped without generating anything. Every other step
//! goes through generate, safety check, execute and, on failure, the reflex
//! loop until it succeeds, trips the safety policy or exhausts its fix
//! budget.
//!
//! The fix budget counts failed attempts: a generation failure, a rejected
//! fix, an exception and a timeout each use one unit. A step therefore makes
//! at most `max_fix_attempts` attempts.
//!
//! Accepted artifacts are copied to `workspace/<task>/src/` next to the
//! project scaffolding (see [`scaffold`](crate::conductor::scaffold)).

use sdk::errors::EngineError;
use sdk::types::{
    Complexity, ErrorRecord, Outcome, Step, StepReport, StepStatus, Task, TaskReport, TaskStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::conductor::executor::{ExecutionRequest, Executor};
use crate::conductor::generator::{extract_imports, DependencyContext, Generator};
use crate::conductor::planner::Planner;
use crate::conductor::reflex::{self, Reflex};
use crate::conductor::scaffold;
use crate::conductor::status::StatusBoard;
use crate::config::Config;
use crate::llm::InferencePort;
use crate::memory::{MemoryStore, OutcomeRecord};
use crate::safety_policy::{SafetyPolicy, SafetyVerdict};

/// Lines of stdout kept in a step report
const OUTPUT_TAIL_LINES: usize = 20;

/// Settings the orchestrator reads on every task
#[derive(Debug, Clone)]
struct Settings {
    max_fix_attempts: u32,
    similar_experiences: usize,
    workspace: PathBuf,
    artifact_extension: String,
    language: String,
}

/// Per-step bookkeeping that the store does not hold directly
#[derive(Debug, Clone, Default)]
struct StepStats {
    attempts: u32,
    stdout: Option<String>,
}

/// In-memory state of one task run
struct TaskRun {
    task: Task,
    complexity: Option<Complexity>,
    steps: Vec<Step>,
    stats: Vec<StepStats>,
    versions: usize,
}

impl TaskRun {
    fn report(&self) -> TaskReport {
        TaskReport {
            task: self.task.clone(),
            complexity: self.complexity,
            steps: self
                .steps
                .iter()
                .zip(&self.stats)
                .map(|(step, stats)| step_report(step, stats.attempts, stats.stdout.as_deref()))
                .collect(),
            versions: self.versions,
        }
    }
}

pub struct Orchestrator {
    planner: Planner,
    generator: Arc<Generator>,
    reflex: Reflex,
    safety: SafetyPolicy,
    executor: Executor,
    memory: Arc<MemoryStore>,
    board: Arc<StatusBoard>,
    settings: Settings,
}

impl Orchestrator {
    /// Wire the pipeline from config
    ///
    /// # Errors
    ///
    /// Returns an error if the safety policy does not compile.
    pub fn new(
        config: &Config,
        llm: Arc<InferencePort>,
        memory: Arc<MemoryStore>,
        board: Arc<StatusBoard>,
    ) -> anyhow::Result<Self> {
        let generator = Arc::new(Generator::new(
            Arc::clone(&llm),
            config.agents.coder.clone(),
        ));

        Ok(Self {
            planner: Planner::new(llm, config.agents.planner.clone()),
            reflex: Reflex::new(Arc::clone(&generator)),
            generator,
            safety: SafetyPolicy::from_config(&config.safety)?,
            executor: Executor::new(config.execution.clone(), config.safety.sandbox_enabled),
            memory,
            board,
            settings: Settings {
                max_fix_attempts: config.agents.reflex.max_fix_attempts.max(1),
                similar_experiences: config.agents.planner.similar_experiences,
                workspace: config.core.workspace.clone(),
                artifact_extension: config.execution.artifact_extension.clone(),
                language: config.agents.coder.language.clone(),
            },
        })
    }

    /// Run a task to a terminal status
    ///
    /// The task must already exist in the store with status `Pending`. The
    /// returned report reflects the in-memory state at the end of the run;
    /// if a history write failed it shows where the task stopped.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn run(&self, task: Task) -> TaskReport {
        let task_id = task.id.clone();
        let mut run = TaskRun {
            task,
            complexity: None,
            steps: Vec::new(),
            stats: Vec::new(),
            versions: 0,
        };

        if let Err(e) = self.drive(&mut run).await {
            error!("Task {} aborted: {}", task_id, e);
            self.abort(&mut run, &e).await;
        }

        match self.memory.get_task(&task_id).await {
            Ok(Some(stored)) => run.task = stored,
            Ok(None) => warn!("Task {} vanished from the store", task_id),
            Err(e) => warn!("Failed to reload task {}: {}", task_id, e),
        }

        self.board.finish(&task_id, run.task.status);
        run.report()
    }

    async fn drive(&self, run: &mut TaskRun) -> Result<(), EngineError> {
        let task_id = run.task.id.clone();

        self.transition(run, TaskStatus::Planning).await?;
        self.note(&task_id, "Planning");

        let experiences = self
            .memory
            .retrieve_similar(&run.task.description, self.settings.similar_experiences)
            .await;

        let plan = match self
            .planner
            .plan(&task_id, &run.task.description, &experiences)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Planning failed for task {}: {}", task_id, e);
                self.note(&task_id, format!("Planning failed: {}", e));
                let message = EngineError::from(e).to_string();
                self.memory
                    .finish_task(&task_id, TaskStatus::PlanFailed, Some(&message))
                    .await?;
                run.task.status = TaskStatus::PlanFailed;
                run.task.error = Some(message);
                self.memory
                    .record_outcome(OutcomeRecord::Task {
                        task_id: task_id.clone(),
                        task_type: crate::conductor::planner::analyze_task_type(
                            &run.task.description,
                        )
                        .to_string(),
                        description: run.task.description.clone(),
                        status: TaskStatus::PlanFailed,
                    })
                    .await?;
                return Ok(());
            }
        };

        self.memory
            .set_task_profile(&task_id, &plan.task_type, Some(plan.complexity))
            .await?;
        run.task.task_type = Some(plan.task_type.clone());
        run.complexity = Some(plan.complexity);

        self.memory.insert_steps(&task_id, &plan.steps).await?;
        run.stats = vec![StepStats::default(); plan.steps.len()];
        run.steps = plan.steps;
        self.note(
            &task_id,
            format!(
                "Plan ready: {} steps ({} complexity)",
                run.steps.len(),
                plan.complexity
            ),
        );

        self.transition(run, TaskStatus::Executing).await?;
        let project_dir = self.settings.workspace.join(&task_id);
        if let Err(e) = scaffold::write_gitignore(&project_dir).await {
            warn!("Failed to write .gitignore for task {}: {}", task_id, e);
        }

        for index in 0..run.steps.len() {
            let mut step = run.steps[index].clone();

            if let Some(blocker) = failed_dependency(&run.steps, &step) {
                step.status = StepStatus::Skipped;
                step.error = Some(format!("Dependency {} did not succeed", blocker));
                self.note(
                    &task_id,
                    format!(
                        "Step {} skipped: dependency {} did not succeed",
                        step.sequence_index + 1,
                        blocker
                    ),
                );
                self.memory.update_step(&step).await?;
                run.steps[index] = step;
                continue;
            }

            let context = dependency_context(run, &step);
            let mut stats = StepStats::default();
            let result = self
                .run_step(&mut step, &context, &task_type(run), &mut stats)
                .await;
            if step.status == StepStatus::Succeeded {
                run.versions += 1;
            }
            run.steps[index] = step;
            run.stats[index] = stats;
            result?;
        }

        if self.settings.language.eq_ignore_ascii_case("python") {
            let accepted = run
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Succeeded)
                .filter_map(|s| s.artifact.as_deref());
            match scaffold::write_requirements(&project_dir, accepted).await {
                Ok(count) => info!("requirements.txt lists {} module(s)", count),
                Err(e) => warn!("Failed to write requirements.txt for task {}: {}", task_id, e),
            }
        }

        let statuses: Vec<StepStatus> = run.steps.iter().map(|s| s.status).collect();
        let final_status = TaskStatus::roll_up(&statuses);
        self.memory.finish_task(&task_id, final_status, None).await?;
        run.task.status = final_status;
        self.board.set_status(&task_id, final_status);

        let succeeded = statuses
            .iter()
            .filter(|s| **s == StepStatus::Succeeded)
            .count();
        self.note(
            &task_id,
            format!(
                "Task {}: {}/{} steps succeeded",
                final_status,
                succeeded,
                statuses.len()
            ),
        );

        self.memory
            .record_outcome(OutcomeRecord::Task {
                task_id: task_id.clone(),
                task_type: task_type(run),
                description: run.task.description.clone(),
                status: final_status,
            })
            .await?;

        Ok(())
    }

    /// Generate, check, execute and repair one step until it settles
    #[instrument(skip_all, fields(step = step.sequence_index + 1))]
    async fn run_step(
        &self,
        step: &mut Step,
        context: &[DependencyContext],
        task_type: &str,
        stats: &mut StepStats,
    ) -> Result<(), EngineError> {
        let task_id = step.task_id.clone();
        let budget = self.settings.max_fix_attempts;

        step.status = StepStatus::Running;
        self.memory.update_step(step).await?;
        self.board.set_current_step(
            &task_id,
            Some((step.sequence_index, step.description.clone())),
        );
        self.note(
            &task_id,
            format!("Step {}: {}", step.sequence_index + 1, step.description),
        );

        let mut history: Vec<ErrorRecord> = Vec::new();
        let mut next: Option<Result<String, EngineError>> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            stats.attempts = attempt;

            let candidate = match next.take() {
                Some(candidate) => candidate,
                None => self.generator.generate(step, context).await,
            };

            let code = match candidate {
                Ok(code) => code,
                Err(e) => {
                    self.note(
                        &task_id,
                        format!("Attempt {} produced no artifact: {}", attempt, e),
                    );
                    let record = reflex::generation_failure(step, attempt, &e);
                    self.memory.record_error(&record).await?;
                    step.error_kind = Some(record.error_kind);
                    step.error = Some(record.message.clone());
                    history.push(record);
                    step.fix_attempts_used += 1;

                    if step.fix_attempts_used >= budget {
                        return self.exhaust(step, task_type).await;
                    }
                    self.memory.update_step(step).await?;
                    continue;
                }
            };

            step.artifact = Some(code.clone());

            if let SafetyVerdict::Violation(violation) = self.safety.check(&code) {
                return self.refuse(step, task_type, &code, &violation.to_string()).await;
            }

            let result = self
                .executor
                .run(&ExecutionRequest {
                    task_id: task_id.clone(),
                    step_id: step.id.clone(),
                    sequence_index: step.sequence_index,
                    attempt_number: attempt,
                    artifact: code.clone(),
                })
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(format!("{:#}", e))))?;

            self.memory.record_execution(&task_id, &result).await?;
            stats.stdout = Some(result.stdout.clone());

            if result.outcome == Outcome::Success {
                return self.accept(step, task_type, &code, &history).await;
            }

            let out_of_budget = step.fix_attempts_used + 1 >= budget;
            let record = if out_of_budget {
                reflex::final_failure(step, attempt, &result)
            } else {
                let diagnosis = self
                    .reflex
                    .diagnose(step, attempt, &result, &code, &history)
                    .await;
                next = Some(diagnosis.patched);
                diagnosis.record
            };

            self.note(
                &task_id,
                format!(
                    "Attempt {} failed ({}): {}",
                    attempt, record.error_kind, record.message
                ),
            );
            self.memory.record_error(&record).await?;
            step.error_kind = Some(record.error_kind);
            step.error = Some(record.message.clone());
            history.push(record);
            step.fix_attempts_used += 1;

            if out_of_budget {
                return self.exhaust(step, task_type).await;
            }
            self.memory.update_step(step).await?;
        }
    }

    async fn accept(
        &self,
        step: &mut Step,
        task_type: &str,
        code: &str,
        history: &[ErrorRecord],
    ) -> Result<(), EngineError> {
        let task_id = step.task_id.clone();

        step.status = StepStatus::Succeeded;
        step.error = None;
        self.memory.update_step(step).await?;

        if let Some(last) = history.last() {
            self.memory.mark_error_fixed(&task_id, &step.id).await?;
            self.memory
                .record_outcome(OutcomeRecord::Fix {
                    task_id: task_id.clone(),
                    step_id: step.id.clone(),
                    task_type: task_type.to_string(),
                    error_kind: last.error_kind,
                    fix_description: last.derived_fix_description.clone(),
                })
                .await?;
        }

        let version = self.memory.commit_version(step, code).await?;
        self.materialize(step, code).await;

        self.memory
            .record_outcome(OutcomeRecord::Step {
                task_id: task_id.clone(),
                step_id: step.id.clone(),
                task_type: task_type.to_string(),
                description: step.description.clone(),
                status: StepStatus::Succeeded,
                detail: None,
            })
            .await?;

        self.note(
            &task_id,
            format!(
                "Step {} succeeded after {} fix attempt(s), version {}",
                step.sequence_index + 1,
                step.fix_attempts_used,
                version.sequence
            ),
        );
        Ok(())
    }

    /// End a step whose artifact broke the safety policy
    async fn refuse(
        &self,
        step: &mut Step,
        task_type: &str,
        code: &str,
        violation: &str,
    ) -> Result<(), EngineError> {
        let task_id = step.task_id.clone();
        let imports = extract_imports(code);
        let detail = if imports.is_empty() {
            violation.to_string()
        } else {
            format!("{} (imports: {})", violation, imports.join("; "))
        };

        warn!("Step {} refused by safety policy: {}", step.sequence_index + 1, detail);
        self.note(
            &task_id,
            format!("Step {} refused: {}", step.sequence_index + 1, violation),
        );

        step.status = StepStatus::SafetyViolation;
        step.error = Some(EngineError::SafetyViolation(detail.clone()).to_string());
        self.memory.update_step(step).await?;

        self.memory
            .record_outcome(OutcomeRecord::Step {
                task_id,
                step_id: step.id.clone(),
                task_type: task_type.to_string(),
                description: step.description.clone(),
                status: StepStatus::SafetyViolation,
                detail: Some(detail),
            })
            .await?;
        Ok(())
    }

    async fn exhaust(&self, step: &mut Step, task_type: &str) -> Result<(), EngineError> {
        let task_id = step.task_id.clone();
        let last = step.error.clone().unwrap_or_default();

        step.status = StepStatus::FixExhausted;
        step.error = Some(format!(
            "{}: {}",
            EngineError::FixExhausted {
                attempts: step.fix_attempts_used
            },
            last
        ));
        self.memory.update_step(step).await?;

        self.note(
            &task_id,
            format!(
                "Step {} gave up after {} attempt(s)",
                step.sequence_index + 1,
                step.fix_attempts_used
            ),
        );

        let detail = step
            .error_kind
            .map(|kind| format!("{}: {}", kind, last))
            .unwrap_or(last);
        self.memory
            .record_outcome(OutcomeRecord::Step {
                task_id,
                step_id: step.id.clone(),
                task_type: task_type.to_string(),
                description: step.description.clone(),
                status: StepStatus::FixExhausted,
                detail: Some(detail),
            })
            .await?;
        Ok(())
    }

    /// Copy an accepted artifact into the task workspace
    ///
    /// The version log is the durable record; this copy is for people.
    async fn materialize(&self, step: &Step, code: &str) {
        let dir = self.settings.workspace.join(&step.task_id).join("src");
        let path = dir.join(format!(
            "step_{}.{}",
            step.sequence_index + 1,
            self.settings.artifact_extension
        ));

        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, code).await
        }
        .await;

        if let Err(e) = written {
            warn!("Failed to write {}: {}", path.display(), e);
        }
    }

    async fn transition(&self, run: &mut TaskRun, next: TaskStatus) -> Result<(), EngineError> {
        if !run.task.status.can_transition_to(next) {
            warn!(
                "Unexpected transition {} -> {} for task {}",
                run.task.status, next, run.task.id
            );
        }
        self.memory.set_task_status(&run.task.id, next).await?;
        run.task.status = next;
        self.board.set_status(&run.task.id, next);
        Ok(())
    }

    /// Best-effort terminal write after a fatal error
    async fn abort(&self, run: &mut TaskRun, cause: &EngineError) {
        let task_id = run.task.id.clone();
        let message = cause.to_string();
        self.note(&task_id, format!("Aborted: {}", message));

        run.task.status = TaskStatus::Aborted;
        run.task.error = Some(message.clone());

        if let Err(e) = self
            .memory
            .finish_task(&task_id, TaskStatus::Aborted, Some(&message))
            .await
        {
            error!("Failed to record abort of task {}: {}", task_id, e);
            return;
        }

        if let Err(e) = self
            .memory
            .record_outcome(OutcomeRecord::Task {
                task_id: task_id.clone(),
                task_type: task_type(run),
                description: run.task.description.clone(),
                status: TaskStatus::Aborted,
            })
            .await
        {
            warn!("Failed to record outcome of aborted task {}: {}", task_id, e);
        }
    }

    fn note(&self, task_id: &str, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.board.log(task_id, line);
    }
}

fn task_type(run: &TaskRun) -> String {
    run.task
        .task_type
        .clone()
        .unwrap_or_else(|| "general".to_string())
}

/// Key of the first dependency that did not succeed
fn failed_dependency(steps: &[Step], step: &Step) -> Option<String> {
    step.dependencies.iter().find_map(|dep_id| {
        match steps.iter().find(|s| &s.id == dep_id) {
            Some(dep) if dep.status == StepStatus::Succeeded => None,
            Some(dep) => Some(dep.key.clone()),
            None => Some(dep_id.clone()),
        }
    })
}

fn dependency_context(run: &TaskRun, step: &Step) -> Vec<DependencyContext> {
    step.dependencies
        .iter()
        .filter_map(|dep_id| {
            let index = run.steps.iter().position(|s| &s.id == dep_id)?;
            let dep = &run.steps[index];
            Some(DependencyContext {
                sequence_index: dep.sequence_index,
                description: dep.description.clone(),
                artifact: dep.artifact.clone()?,
                stdout_tail: run.stats[index].stdout.clone().unwrap_or_default(),
            })
        })
        .collect()
}

/// Last `max` lines of a block of text
pub fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}

pub fn step_report(step: &Step, attempts: u32, stdout: Option<&str>) -> StepReport {
    StepReport {
        step_id: step.id.clone(),
        sequence_index: step.sequence_index,
        description: step.description.clone(),
        status: step.status,
        error_kind: step.error_kind,
        fix_attempts_used: step.fix_attempts_used,
        attempts,
        error: step.error.clone(),
        output_tail: stdout
            .filter(|s| !s.trim().is_empty())
            .map(|s| tail_lines(s, OUTPUT_TAIL_LINES)),
    }
}

/// Rebuild a task report from the store
///
/// Returns `Ok(None)` for an unknown task id.
pub async fn load_report(
    memory: &MemoryStore,
    task_id: &str,
) -> Result<Option<TaskReport>, EngineError> {
    let Some(task) = memory.get_task(task_id).await? else {
        return Ok(None);
    };
    let complexity = memory.get_task_complexity(task_id).await?;
    let steps = memory.get_steps(task_id).await?;

    let mut reports = Vec::with_capacity(steps.len());
    for step in &steps {
        let results = memory.get_execution_results(&step.id).await?;
        let errors = memory.get_step_errors(&step.id).await?;
        let attempts = results
            .iter()
            .map(|r| r.attempt_number)
            .chain(errors.iter().map(|e| e.attempt_number))
            .max()
            .unwrap_or(0);
        let stdout = results.last().map(|r| r.stdout.as_str());
        reports.push(step_report(step, attempts, stdout));
    }

    let versions = memory.version_history(task_id).await?.len();

    Ok(Some(TaskReport {
        task,
        complexity,
        steps: reports,
        versions,
    }))
}
