use crate::agent::completion::CompletionClient;
use crate::agent::history::{Action, EntryStatus};
use crate::agent::outcome::{
    OutcomeParts, ResolutionOutcome, ResolutionRequest, StepLog, Verification,
};
use crate::agent::prompt::render_prompt;
use crate::agent::review::{ReviewFinding, review_diff};
use crate::agent::session::{Goal, ResolutionSession, SessionState};
use crate::config::{AgentConfig, Config};
use crate::error::{FailureReason, PatchError, RunnerError, StoreError};
use crate::exec::checkout::{PatchApplier, WorkingCheckout};
use crate::exec::patch::UnifiedDiff;
use crate::exec::runner::{CommandRunner, RunOutput, VerifyRunner, VerifyStep};
use crate::model::RetrievedContext;
use crate::retrieve::{ContextRetriever, SCORING};
use crate::store::GraphStore;
use std::sync::Arc;
use std::time::Duration;

/// External collaborators one session talks to.
pub struct Collaborators {
    pub completion: Arc<dyn CompletionClient>,
    pub runner: Arc<dyn CommandRunner>,
    /// When absent, issue sessions copy the repository into a fresh
    /// `WorkingCheckout` on first apply.
    pub applier: Option<Box<dyn PatchApplier>>,
}

impl Collaborators {
    pub fn new(completion: Arc<dyn CompletionClient>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            completion,
            runner,
            applier: None,
        }
    }

    pub fn with_applier(mut self, applier: Box<dyn PatchApplier>) -> Self {
        self.applier = Some(applier);
        self
    }
}

/// Mutable state of one session while it is driven.
struct Run {
    session: ResolutionSession,
    request: ResolutionRequest,
    collaborators: Collaborators,
    context: RetrievedContext,
    review_target: Option<UnifiedDiff>,
    candidate: Option<UnifiedDiff>,
    applied: Option<UnifiedDiff>,
    answer: Option<String>,
    findings: Vec<ReviewFinding>,
    logs: Vec<StepLog>,
    verification: Verification,
    warnings: Vec<String>,
    /// R1 counter: consecutive generation or apply failures.
    generation_failures: u32,
    last_failure_was_apply: bool,
    /// R2 counter: build and test failures over the whole session.
    verify_failures: u32,
}

impl Run {
    fn record_failure(&mut self, action: Action, status: EntryStatus, result: String, apply: bool) {
        tracing::warn!(
            session_id = %self.session.session_id,
            action = %action,
            attempt = self.session.attempt_count,
            result = %result.lines().next().unwrap_or_default(),
            "session.step_failed"
        );
        self.session.history.push(action, status, result);
        self.generation_failures += 1;
        self.last_failure_was_apply = apply;
    }

    /// A successful patch keeps its checkout for the caller; every other
    /// checkout is removed with the applier.
    fn finish(mut self) -> ResolutionOutcome {
        if self.session.state == SessionState::Succeeded && self.applied.is_some() {
            if let Some(applier) = self.collaborators.applier.as_mut() {
                applier.persist();
            }
        } else {
            self.session.working_checkout_path = None;
        }
        let patch_stats = self.applied.as_ref().map(|diff| {
            let (added, removed) = diff.lines_changed();
            let paths = diff.touched_paths().into_iter().map(str::to_string).collect();
            (paths, added, removed)
        });
        let parts = OutcomeParts {
            patch: self.applied.as_ref().map(UnifiedDiff::render),
            patch_stats,
            answer: self.answer,
            findings: self.findings,
            logs: self.logs,
            verification: self.verification,
            warnings: self.warnings,
        };
        ResolutionOutcome::from_session(self.session, parts)
    }
}

/// Drives a session through retrieval, generation, apply, build, test and
/// review. Phases of one session never overlap.
pub struct AgentStateMachine {
    store: Arc<dyn GraphStore>,
    retriever: Arc<ContextRetriever>,
    config: AgentConfig,
    default_budget: usize,
    checkout_no_ignore: bool,
}

impl AgentStateMachine {
    pub fn new(store: Arc<dyn GraphStore>, config: &Config) -> Self {
        let retriever = Arc::new(ContextRetriever::new(store.clone(), config.retrieval.clone()));
        Self {
            store,
            retriever,
            config: config.agent.clone(),
            default_budget: config.retrieval.token_budget,
            checkout_no_ignore: !config.ingest.follow_gitignore,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Always returns an outcome; failures are reported in it, never raised.
    pub async fn run(&self, request: ResolutionRequest, collaborators: Collaborators) -> ResolutionOutcome {
        let session = ResolutionSession::new(
            request.goal,
            request.repository.clone(),
            request.content.clone(),
        );
        tracing::info!(
            session_id = %session.session_id,
            goal = %session.goal,
            repository = %session.repository.key(),
            revision = %session.repository.revision,
            "session.started"
        );
        let verification = match request.goal {
            Goal::Issue => Verification::Skipped,
            Goal::Question | Goal::Review => Verification::NotApplicable,
        };
        let mut run = Run {
            session,
            request,
            collaborators,
            context: RetrievedContext::empty("", SCORING, 0),
            review_target: None,
            candidate: None,
            applied: None,
            answer: None,
            findings: Vec::new(),
            logs: Vec::new(),
            verification,
            warnings: Vec::new(),
            generation_failures: 0,
            last_failure_was_apply: false,
            verify_failures: 0,
        };

        let limit = self.config.session_timeout();
        match tokio::time::timeout(limit, self.drive(&mut run)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => run.session.fail(reason),
            Err(_) => {
                run.warnings
                    .push(format!("session timed out after {}s", limit.as_secs()));
                run.session.fail(FailureReason::Timeout);
            }
        }

        let outcome = run.finish();
        tracing::info!(
            session_id = %outcome.session_id,
            status = ?outcome.status,
            attempts = outcome.attempts,
            "session.finished"
        );
        outcome
    }

    async fn drive(&self, run: &mut Run) -> Result<(), FailureReason> {
        loop {
            match run.session.state {
                SessionState::Retrieving => self.retrieving(run).await?,
                SessionState::Generating => self.generating(run).await?,
                SessionState::Applying => self.applying(run).await?,
                SessionState::Building => self.verifying(run, VerifyStep::Build).await?,
                SessionState::Testing => self.verifying(run, VerifyStep::Test).await?,
                SessionState::Reviewing => self.reviewing(run).await?,
                SessionState::Succeeded | SessionState::Failed(_) => return Ok(()),
            }
        }
    }

    async fn retrieving(&self, run: &mut Run) -> Result<(), FailureReason> {
        let mut query = run.request.content.clone();
        if run.request.goal == Goal::Review {
            match UnifiedDiff::from_completion(&run.request.content) {
                Ok(diff) => {
                    for path in diff.touched_paths() {
                        query.push(' ');
                        query.push_str(path);
                    }
                    run.review_target = Some(diff);
                }
                Err(err) => run
                    .warnings
                    .push(format!("review request has no usable diff ({err}); graph findings skipped")),
            }
        }

        let budget = run.request.token_budget.unwrap_or(self.default_budget);
        let retriever = self.retriever.clone();
        let repo = run.session.repository.clone();
        let context = self
            .with_store_retry("retrieve", move || retriever.retrieve(&query, &repo, budget))
            .await
            .inspect_err(|_| {
                run.session.history.push(
                    Action::Retrieve,
                    EntryStatus::Failed,
                    "graph store unavailable",
                );
            })?;

        let result = if context.is_empty() {
            run.warnings
                .push("no graph anchors matched the request; generating from its text alone".to_string());
            "no matching code; proceeding with the request text only".to_string()
        } else {
            format!(
                "{} fragments, {} of {} tokens{}",
                context.fragments.len(),
                context.used_tokens,
                context.token_budget,
                if context.truncated { ", truncated" } else { "" }
            )
        };
        run.session.history.push(Action::Retrieve, EntryStatus::Ok, result);
        run.context = context;
        run.session.advance(SessionState::Generating);
        Ok(())
    }

    async fn generating(&self, run: &mut Run) -> Result<(), FailureReason> {
        let r1 = self.config.max_generation_attempts.max(1);
        if run.generation_failures >= r1 {
            return Err(if run.last_failure_was_apply {
                FailureReason::ApplyExhausted
            } else {
                FailureReason::GenerationExhausted
            });
        }
        if run.session.attempt_count > 0 {
            self.backoff(run.session.attempt_count).await;
        }
        run.session.attempt_count += 1;

        let history = run.session.history.render(self.config.max_history_entries);
        let prompt = render_prompt(run.request.goal, &run.request.content, &run.context, &history);
        let completion = run.collaborators.completion.complete(&prompt).await;
        let text = match completion {
            Ok(text) => text,
            Err(err) => {
                run.record_failure(Action::Generate, EntryStatus::Transient, err.to_string(), false);
                run.session.advance(SessionState::Generating);
                return Ok(());
            }
        };

        match run.request.goal {
            Goal::Question | Goal::Review => {
                if text.trim().is_empty() {
                    run.record_failure(
                        Action::Generate,
                        EntryStatus::Failed,
                        "empty answer".to_string(),
                        false,
                    );
                    run.session.advance(SessionState::Generating);
                    return Ok(());
                }
                run.session.history.push(
                    Action::Generate,
                    EntryStatus::Ok,
                    format!("answer of {} chars", text.chars().count()),
                );
                run.generation_failures = 0;
                run.answer = Some(text);
                let next = if run.review_target.is_some() {
                    SessionState::Reviewing
                } else {
                    SessionState::Succeeded
                };
                run.session.advance(next);
            }
            Goal::Issue => match UnifiedDiff::from_completion(&text) {
                Ok(diff) => {
                    let (added, removed) = diff.lines_changed();
                    run.session.history.push(
                        Action::Generate,
                        EntryStatus::Ok,
                        format!(
                            "diff for {} (+{added} -{removed})",
                            diff.touched_paths().join(", ")
                        ),
                    );
                    run.candidate = Some(diff);
                    run.session.advance(SessionState::Applying);
                }
                Err(err) => {
                    run.record_failure(Action::Generate, EntryStatus::Failed, err.to_string(), false);
                    run.session.advance(SessionState::Generating);
                }
            },
        }
        Ok(())
    }

    async fn applying(&self, run: &mut Run) -> Result<(), FailureReason> {
        let Some(candidate) = run.candidate.take() else {
            run.session.advance(SessionState::Generating);
            return Ok(());
        };

        if run.collaborators.applier.is_none() {
            let root = run.session.repository.root.clone();
            let revision = run.session.repository.revision.clone();
            let no_ignore = self.checkout_no_ignore;
            let created =
                tokio::task::spawn_blocking(move || WorkingCheckout::create(&root, &revision, no_ignore))
                    .await
                .map_err(|err| PatchError::CheckoutCorrupted(err.to_string()))
                .and_then(|result| result);
            match created {
                Ok(checkout) => run.collaborators.applier = Some(Box::new(checkout)),
                Err(err) => {
                    run.session
                        .history
                        .push(Action::Apply, EntryStatus::Failed, err.to_string());
                    return Err(FailureReason::CheckoutCorrupted);
                }
            }
        }
        let Some(mut applier) = run.collaborators.applier.take() else {
            return Err(FailureReason::CheckoutCorrupted);
        };
        let patch = candidate.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = applier.apply(&patch);
            (applier, result)
        })
        .await;
        let (applier, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                run.session
                    .history
                    .push(Action::Apply, EntryStatus::Failed, err.to_string());
                return Err(FailureReason::CheckoutCorrupted);
            }
        };
        let workdir = applier.workdir().to_path_buf();
        run.collaborators.applier = Some(applier);

        match result {
            Ok(()) => {
                run.session.history.push(
                    Action::Apply,
                    EntryStatus::Ok,
                    format!("applied to {}", candidate.touched_paths().join(", ")),
                );
                run.session.working_checkout_path = Some(workdir);
                run.generation_failures = 0;
                run.last_failure_was_apply = false;
                run.applied = Some(candidate);
                let verify = &run.request.verify;
                let next = if verify.build.is_some() {
                    SessionState::Building
                } else if verify.test.is_some() {
                    SessionState::Testing
                } else {
                    run.verification = Verification::Skipped;
                    SessionState::Succeeded
                };
                run.session.advance(next);
                Ok(())
            }
            Err(PatchError::CheckoutCorrupted(message)) => {
                run.session
                    .history
                    .push(Action::Apply, EntryStatus::Failed, message);
                Err(FailureReason::CheckoutCorrupted)
            }
            Err(err) => {
                run.record_failure(Action::Apply, EntryStatus::Failed, err.to_string(), true);
                run.session.advance(SessionState::Generating);
                Ok(())
            }
        }
    }

    async fn verifying(&self, run: &mut Run, step: VerifyStep) -> Result<(), FailureReason> {
        let (action, after_success) = match step {
            VerifyStep::Build if run.request.verify.test.is_some() => {
                (Action::Build, SessionState::Testing)
            }
            VerifyStep::Build => (Action::Build, SessionState::Succeeded),
            VerifyStep::Test => (Action::Test, SessionState::Succeeded),
        };
        let Some(workdir) = run.session.working_checkout_path.clone() else {
            return Err(FailureReason::CheckoutCorrupted);
        };
        let command = run
            .request
            .verify
            .command(step)
            .unwrap_or_default()
            .to_string();

        let result = {
            let verify = VerifyRunner::new(
                run.collaborators.runner.as_ref(),
                &run.request.verify,
                self.config.command_timeout(),
            );
            verify.run(step, &workdir).await
        };
        let output = match result {
            Ok(Some(output)) => output,
            Ok(None) => {
                if after_success == SessionState::Succeeded {
                    run.verification = Verification::Verified;
                }
                run.session.advance(after_success);
                return Ok(());
            }
            Err(RunnerError::MissingWorkingDir(path)) => {
                run.session.history.push(
                    action,
                    EntryStatus::Failed,
                    format!("working checkout {} is gone", path.display()),
                );
                return Err(FailureReason::CheckoutCorrupted);
            }
            Err(err) => RunOutput {
                exit_code: None,
                stderr: err.to_string(),
                ..RunOutput::default()
            },
        };

        let log = StepLog::new(
            step,
            run.verify_failures + 1,
            &command,
            &output,
            self.config.max_log_bytes,
        );
        let passed = log.success;
        let detail = log.output.clone();
        run.logs.push(log);

        if passed {
            run.session.history.push(
                action,
                EntryStatus::Ok,
                format!("`{command}` passed in {}ms", output.duration_ms),
            );
            if after_success == SessionState::Succeeded {
                run.verification = Verification::Verified;
            }
            run.session.advance(after_success);
            return Ok(());
        }

        let status = match output.exit_code {
            Some(code) => format!("exit {code}"),
            None if output.timed_out => "timed out".to_string(),
            None => "did not run".to_string(),
        };
        run.session.history.push(
            action,
            EntryStatus::Failed,
            format!("`{command}` failed ({status})\n{detail}"),
        );
        run.verify_failures += 1;
        if run.verify_failures >= self.config.max_verify_attempts.max(1) {
            return Err(FailureReason::VerifyExhausted);
        }
        run.session.advance(SessionState::Generating);
        Ok(())
    }

    async fn reviewing(&self, run: &mut Run) -> Result<(), FailureReason> {
        let Some(diff) = run.review_target.clone() else {
            run.session.advance(SessionState::Succeeded);
            return Ok(());
        };
        let store = self.store.clone();
        let scope = run.session.repository.scope();
        let findings = self
            .with_store_retry("review", move || review_diff(store.as_ref(), &scope, &diff))
            .await
            .inspect_err(|_| {
                run.session.history.push(
                    Action::Review,
                    EntryStatus::Failed,
                    "graph store unavailable",
                );
            })?;
        run.session.history.push(
            Action::Review,
            EntryStatus::Ok,
            format!("{} findings", findings.len()),
        );
        run.findings = findings;
        run.session.advance(SessionState::Succeeded);
        Ok(())
    }

    async fn backoff(&self, attempt: u32) {
        let delay: Duration = self.config.backoff.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a blocking store call off the async workers, retrying retryable
    /// errors with backoff. Exhaustion is `StoreUnavailable`.
    async fn with_store_retry<T, F>(&self, op: &'static str, call: F) -> Result<T, FailureReason>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let attempts = self.config.store_retries.max(1);
        for attempt in 1..=attempts {
            let task = call.clone();
            let (message, retryable) = match tokio::task::spawn_blocking(task).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => (err.to_string(), err.is_retryable()),
                Err(err) => (err.to_string(), false),
            };
            tracing::warn!(op, attempt, error = %message, retryable, "session.store_retry");
            if !retryable || attempt == attempts {
                break;
            }
            self.backoff(attempt).await;
        }
        Err(FailureReason::StoreUnavailable)
    }
}
