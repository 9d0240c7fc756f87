use async_trait::async_trait;
use repograph::agent::{
    Action, Collaborators, CompletionClient, EntryStatus, Goal, OutcomeStatus, ResolutionRequest,
    SessionState, Verification,
};
use repograph::config::{BackoffConfig, Config};
use repograph::error::{CompletionError, FailureReason, IngestError};
use repograph::exec::{ShellCommandRunner, VerifyCommands};
use repograph::model::RepositoryRef;
use repograph::store::MemoryGraphStore;
use repograph::{Engine, IngestOverrides};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const WRONG_FIX: &str = "Let me try this.\n\n```diff\n--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a * b\n```\n";

const RIGHT_FIX: &str = "```diff\ndiff --git a/calc.py b/calc.py\n--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n```\n";

const STALE_FIX: &str = "```diff\n--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(x, y):\n-    return x - y\n+    return x + y\n```\n";

const TEST_CMD: &str = "grep -q 'return a + b' calc.py || { echo 'FAIL test_add: add(2, 3) != 5'; exit 1; }";

struct Scripted {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for Scripted {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::Unavailable("no more replies".into())))
    }
}

/// Blocks until released, then answers.
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl CompletionClient for Gated {
    async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok("It adds.".to_string())
    }
}

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}

fn setup() -> (tempfile::TempDir, RepositoryRef, Engine) {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "calc.py", "def add(a, b):\n    return a - b\n");
    write(
        dir.path(),
        "report.py",
        "from calc import add\n\n\ndef total(xs):\n    return add(xs[0], xs[1])\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let mut config = Config::default();
    config.ingest.store_backoff = BackoffConfig::none();
    config.agent.backoff = BackoffConfig::none();
    config.agent.command_timeout_secs = 30;
    let engine = Engine::new(config, Arc::new(MemoryGraphStore::new()));
    engine.ingest(&repo, IngestOverrides::default()).unwrap();
    (dir, repo, engine)
}

fn issue(repo: &RepositoryRef, content: &str) -> ResolutionRequest {
    ResolutionRequest {
        goal: Goal::Issue,
        repository: repo.clone(),
        content: content.to_string(),
        verify: VerifyCommands {
            build: Some("true".to_string()),
            test: Some(TEST_CMD.to_string()),
        },
        token_budget: None,
    }
}

#[tokio::test]
async fn failing_test_loops_back_then_succeeds() {
    let (dir, repo, engine) = setup();
    let completion = Scripted::new(vec![Ok(WRONG_FIX.to_string()), Ok(RIGHT_FIX.to_string())]);
    let collaborators = Collaborators::new(completion.clone(), Arc::new(ShellCommandRunner));

    let outcome = engine
        .resolve(issue(&repo, "`add` subtracts instead of adding"), collaborators)
        .await;

    assert_eq!(outcome.state, SessionState::Succeeded, "{}", outcome.summary);
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert_eq!(outcome.verification, Verification::Verified);
    assert_eq!(outcome.attempts, 2);

    let actions: Vec<(Action, EntryStatus)> = outcome
        .history
        .iter()
        .map(|entry| (entry.action, entry.status))
        .collect();
    assert_eq!(
        actions,
        vec![
            (Action::Retrieve, EntryStatus::Ok),
            (Action::Generate, EntryStatus::Ok),
            (Action::Apply, EntryStatus::Ok),
            (Action::Build, EntryStatus::Ok),
            (Action::Test, EntryStatus::Failed),
            (Action::Generate, EntryStatus::Ok),
            (Action::Apply, EntryStatus::Ok),
            (Action::Build, EntryStatus::Ok),
            (Action::Test, EntryStatus::Ok),
        ]
    );
    assert!(outcome.history[4].result.contains("FAIL test_add"));
    let prompts = completion.prompts();
    assert!(prompts[1].contains("FAIL test_add"));

    // the patch landed in the working checkout, never in the repository
    let checkout = outcome.working_checkout.clone().unwrap();
    let patched = std::fs::read_to_string(checkout.join("calc.py")).unwrap();
    assert!(patched.contains("return a + b"));
    let original = std::fs::read_to_string(dir.path().join("calc.py")).unwrap();
    assert!(original.contains("return a - b"));
    assert!(outcome.patch.unwrap().contains("+    return a + b"));
    std::fs::remove_dir_all(checkout).unwrap();
}

#[tokio::test]
async fn unmatched_issue_still_generates_from_its_text() {
    let (_dir, repo, engine) = setup();
    let completion = Scripted::new(vec![Ok(RIGHT_FIX.to_string())]);
    let collaborators = Collaborators::new(completion.clone(), Arc::new(ShellCommandRunner));

    let outcome = engine
        .resolve(issue(&repo, "the totals look odd since yesterday"), collaborators)
        .await;

    assert_eq!(outcome.state, SessionState::Succeeded, "{}", outcome.summary);
    assert_eq!(outcome.warnings.len(), 1);
    let prompt = &completion.prompts()[0];
    assert!(prompt.contains("the totals look odd since yesterday"));
    assert!(!prompt.contains("calc.py:"));
    if let Some(checkout) = outcome.working_checkout {
        std::fs::remove_dir_all(checkout).unwrap();
    }
}

#[tokio::test]
async fn rate_limiting_exhausts_generation() {
    let (_dir, repo, engine) = setup();
    let completion = Scripted::new(vec![
        Err(CompletionError::RateLimited),
        Err(CompletionError::RateLimited),
        Err(CompletionError::RateLimited),
        Ok(RIGHT_FIX.to_string()),
    ]);
    let collaborators = Collaborators::new(completion.clone(), Arc::new(ShellCommandRunner));

    let outcome = engine
        .resolve(issue(&repo, "`add` is wrong"), collaborators)
        .await;

    assert_eq!(outcome.state, SessionState::Failed(FailureReason::GenerationExhausted));
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::GenerationExhausted));
    assert_eq!(completion.prompts().len(), 3);
    assert!(outcome.patch.is_none());
}

#[tokio::test]
async fn patches_that_never_apply_exhaust_after_the_limit() {
    let (_dir, repo, engine) = setup();
    let completion = Scripted::new(vec![Ok(STALE_FIX.to_string()); 4]);
    let collaborators = Collaborators::new(completion.clone(), Arc::new(ShellCommandRunner));

    let outcome = engine
        .resolve(issue(&repo, "`add` is wrong"), collaborators)
        .await;

    assert_eq!(outcome.state, SessionState::Failed(FailureReason::ApplyExhausted));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(completion.prompts().len(), 3);
    // every retry saw the previous apply error
    assert!(completion.prompts()[2].contains("[failed]"));
}

#[tokio::test]
async fn review_reports_callers_outside_the_diff() {
    let (_dir, repo, engine) = setup();
    let completion = Scripted::new(vec![Ok("The sign flip looks intentional.".to_string())]);
    let collaborators = Collaborators::new(completion, Arc::new(ShellCommandRunner));
    let request = ResolutionRequest {
        goal: Goal::Review,
        repository: repo.clone(),
        content: RIGHT_FIX.to_string(),
        verify: VerifyCommands::default(),
        token_budget: None,
    };

    let outcome = engine.resolve(request, collaborators).await;

    assert_eq!(outcome.state, SessionState::Succeeded);
    assert_eq!(outcome.status, OutcomeStatus::Partial);
    assert_eq!(outcome.verification, Verification::NotApplicable);
    assert!(outcome.answer.is_some());
    let rendered: Vec<String> = outcome.findings.iter().map(ToString::to_string).collect();
    assert!(
        rendered.iter().any(|line| line.contains("report.total calls changed calc.add")),
        "{rendered:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingestion_waits_for_active_sessions() {
    let (_dir, repo, engine) = setup();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let completion = Arc::new(Gated {
        started: started.clone(),
        release: release.clone(),
    });
    let collaborators = Collaborators::new(completion, Arc::new(ShellCommandRunner));
    let request = ResolutionRequest {
        goal: Goal::Question,
        repository: repo.clone(),
        content: "what does `add` do?".to_string(),
        verify: VerifyCommands::default(),
        token_budget: None,
    };

    let session_engine = engine.clone();
    let session = tokio::spawn(async move { session_engine.resolve(request, collaborators).await });
    started.notified().await;

    let busy = engine.ingest(&repo, IngestOverrides::default()).unwrap_err();
    assert!(matches!(busy, IngestError::RepositoryBusy(_)));

    release.notify_one();
    let outcome = session.await.unwrap();
    assert_eq!(outcome.answer.as_deref(), Some("It adds."));
    assert!(engine.ingest(&repo, IngestOverrides::default()).is_ok());
}
