//! Debug loop controller
//!
//! The top-level state machine: run the suite, parse failures, escalate each
//! signature through learned fixes, pattern fixes, and the oracle; apply
//! through the vault, revalidate, then commit or roll back. Outcomes feed
//! the ledgers, the learned store, and the session report.

use crate::config::{self, Config};
use crate::confidence::ConfidenceManager;
use crate::executor::TestExecutor;
use crate::failure::{Failure, FailureParser};
use crate::oracle::{OracleAdapter, OracleRequest, PatchOracle};
use crate::patch::{apply_file_diff, full_file_diff, parse_patch, Patch, Provenance};
use crate::pattern::PatternFixer;
use crate::report::{ArtifactSink, Disposition, Reporter};
use crate::rollback::RollbackManager;
use crate::signature::ErrorSignature;
use crate::store::LearnedFixStore;
use crate::tracker::{AttemptStatus, PatchTracker};
use crate::vault::BackupVault;
use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Terminal result of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// All failures cleared.
    Success,
    /// Failures remain after the budget ran out.
    Partial,
    /// Unrecoverable executor error; all mutations rolled back.
    Aborted,
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Success => 0,
            SessionOutcome::Partial => 1,
            SessionOutcome::Aborted => 2,
        }
    }
}

/// Observable controller state, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Triaging,
    Escalating,
    Applying,
    Revalidating,
    Reverting,
    Abandoning,
    Terminal,
}

enum Escalation {
    Fixed,
    Abandoned,
    NoPatch,
}

/// A candidate patch ready for (or already past) application.
struct Candidate {
    patch: Patch,
    /// Set by the import handler so import accounting works.
    import_module: Option<String>,
    /// Pattern fixes mutate the file as they match; no second apply step.
    pre_applied: bool,
}

pub struct Controller {
    project_root: PathBuf,
    config: Config,
    executor: Box<dyn TestExecutor>,
    parser: FailureParser,
    store: LearnedFixStore,
    tracker: PatchTracker,
    confidence: ConfidenceManager,
    oracle: OracleAdapter,
    pattern: PatternFixer,
    rollback: RollbackManager,
    reporter: Reporter,
    sink: Option<Box<dyn ArtifactSink>>,
    /// Restrict the initial run to one file (the `--file` flag).
    focus: Option<PathBuf>,
    state: SessionState,
}

impl Controller {
    pub fn new(
        project_root: PathBuf,
        config: Config,
        executor: Box<dyn TestExecutor>,
        providers: Vec<Box<dyn PatchOracle>>,
        sink: Option<Box<dyn ArtifactSink>>,
        focus: Option<PathBuf>,
    ) -> Self {
        let data_dir = config::data_dir(&project_root);
        let store = LearnedFixStore::load(&data_dir);
        let tracker = PatchTracker::load(&data_dir);
        let mut confidence = ConfidenceManager::new(
            config.apply_threshold,
            config.retry_threshold,
            config.max_attempts,
            config.jitter_seed,
        );
        confidence.prime_history(tracker.attempt_tallies());
        let oracle = OracleAdapter::new(
            providers,
            config.oracle_prompt_retries,
            config.validation_min_score,
            config.jitter_seed.map(|s| s.wrapping_add(1)),
        );
        let pattern = PatternFixer::new(project_root.clone());
        let rollback = RollbackManager::new(config.max_retries);
        let reporter = Reporter::load(&data_dir);

        Self {
            project_root,
            config,
            executor,
            parser: FailureParser::new(),
            store,
            tracker,
            confidence,
            oracle,
            pattern,
            rollback,
            reporter,
            sink,
            focus,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run one full session to a terminal state. The outer loop wraps
    /// run-triage-fix rounds up to the session retry budget.
    pub fn run_session(&mut self) -> Result<SessionOutcome> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let data_dir = config::data_dir(&self.project_root);
        let mut vault = BackupVault::open(&data_dir, &session_id)?;

        let mut abandoned: HashSet<ErrorSignature> = HashSet::new();
        let mut fixed: HashSet<ErrorSignature> = HashSet::new();
        let initial_targets: Vec<PathBuf> = self.focus.iter().cloned().collect();

        let mut rounds = 0;
        let outcome = loop {
            if rounds >= self.config.session_max_retries.max(1) {
                break SessionOutcome::Partial;
            }
            rounds += 1;
            self.enter(SessionState::Running);
            info!("session round {}/{}", rounds, self.config.session_max_retries);

            let run = match self.executor.run(&initial_targets) {
                Ok(run) => run,
                Err(err) => {
                    warn!("executor failed: {}; aborting session", err);
                    vault.abort()?;
                    break SessionOutcome::Aborted;
                }
            };
            if run.timed_out {
                warn!("executor timed out before any patch; aborting session");
                vault.abort()?;
                break SessionOutcome::Aborted;
            }

            let failures = self.parser.parse(&run.combined());
            if failures.is_empty() {
                if run.exit_code == 0 {
                    break SessionOutcome::Success;
                }
                // Failing exit with output the parser cannot interpret.
                warn!("tests failed but no failures could be parsed; aborting session");
                vault.abort()?;
                break SessionOutcome::Aborted;
            }

            self.enter(SessionState::Triaging);
            let mut seen: HashSet<ErrorSignature> = HashSet::new();
            let mut open = 0;
            for failure in &failures {
                let context = code_context(&self.project_root, failure);
                let sig = ErrorSignature::compute(&failure.message, &context);
                debug!(
                    "triaging {} ({}) as {}",
                    failure.file,
                    failure.kind.name(),
                    sig.short()
                );
                if !seen.insert(sig.clone()) {
                    continue;
                }
                if abandoned.contains(&sig) || fixed.contains(&sig) {
                    continue;
                }
                open += 1;
                if !self.confidence.can_attempt(&sig) {
                    self.abandon_signature(&sig, "attempt budget exhausted before any patch");
                    abandoned.insert(sig);
                    continue;
                }
                match self.escalate(failure, &sig, &mut vault) {
                    Ok(Escalation::Fixed) => {
                        fixed.insert(sig);
                    }
                    Ok(Escalation::Abandoned) => {
                        abandoned.insert(sig);
                    }
                    Ok(Escalation::NoPatch) => {
                        self.abandon_signature(&sig, "no patch source produced a candidate");
                        abandoned.insert(sig);
                    }
                    Err(err) => {
                        // Invariant violation or unrecoverable I/O: restore
                        // everything and go terminal.
                        warn!("fatal error while escalating {}: {}", sig.short(), err);
                        vault.abort()?;
                        self.reporter
                            .set_disposition(sig.as_str(), Disposition::Aborted);
                        return self.finish(SessionOutcome::Aborted);
                    }
                }
            }

            // An abandoned signature stays failed; further rounds cannot help it.
            if open > 0 && seen.iter().any(|s| abandoned.contains(s)) {
                break SessionOutcome::Partial;
            }
        };

        match outcome {
            SessionOutcome::Success | SessionOutcome::Partial => vault.commit(),
            SessionOutcome::Aborted => {
                // Vault already restored; nothing further to undo.
            }
        }
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: SessionOutcome) -> Result<SessionOutcome> {
        if let Err(err) = self.tracker.roll_up_performance() {
            warn!("could not roll up performance: {}", err);
        }
        self.reporter.merge_tracker(&self.tracker);
        self.reporter.finalize(self.sink.as_deref())?;
        self.enter(SessionState::Terminal);
        info!("session finished: {:?}", outcome);
        Ok(outcome)
    }

    /// Escalate one failure through the patch sources, in provenance order,
    /// until it is fixed, abandoned, or nothing produces a candidate.
    fn escalate(
        &mut self,
        failure: &Failure,
        sig: &ErrorSignature,
        vault: &mut BackupVault,
    ) -> Result<Escalation> {
        const ORDER: [Provenance; 3] =
            [Provenance::Learned, Provenance::Pattern, Provenance::Oracle];
        let mut tried: HashSet<String> = HashSet::new();
        let mut produced_any = false;

        loop {
            if !self.confidence.can_attempt(sig) {
                return self.exhaust(failure, sig, vault);
            }
            self.enter(SessionState::Escalating);
            let mut produced_this_pass = false;

            for source in ORDER {
                if !self.confidence.can_attempt(sig) {
                    break;
                }
                let Some(candidate) = self.candidate_from(source, failure, sig, vault)? else {
                    continue;
                };
                let is_repeat = !tried.insert(candidate.patch.diff.clone());
                if is_repeat && !candidate.pre_applied {
                    continue;
                }
                produced_any = true;
                produced_this_pass = true;

                let (score, reason) = self.confidence.assign(sig, &candidate.patch.diff);
                debug!(
                    "candidate from {} scored {:.2} ({})",
                    source.name(),
                    score,
                    reason
                );
                self.confidence.register_attempt(sig);

                let applied = candidate.pre_applied
                    || self.apply_candidate(vault, &candidate.patch)?;
                if !applied {
                    self.confidence.note_outcome(sig, false);
                    if !self.confidence.should_retry(sig) {
                        return self.exhaust(failure, sig, vault);
                    }
                    continue;
                }

                if self.revalidate(failure)? {
                    self.record_success(&candidate, sig)?;
                    return Ok(Escalation::Fixed);
                }

                self.enter(SessionState::Reverting);
                self.rollback.revert_patch(
                    &self.project_root,
                    &candidate.patch,
                    vault,
                    &mut self.tracker,
                    AttemptStatus::AppliedAndFailed,
                    "revalidation failed",
                )?;
                self.confidence.note_outcome(sig, false);
                if let Some(module) = &candidate.import_module {
                    self.tracker.record_import_fix(module, false)?;
                }
                if !self.confidence.should_retry(sig) {
                    return self.exhaust(failure, sig, vault);
                }
            }

            if !produced_this_pass {
                break;
            }
        }

        if !produced_any {
            return Ok(Escalation::NoPatch);
        }
        self.exhaust(failure, sig, vault)
    }

    /// Fetch a candidate from one source. Pattern fixes are applied to the
    /// file as a side effect of matching.
    fn candidate_from(
        &mut self,
        source: Provenance,
        failure: &Failure,
        sig: &ErrorSignature,
        vault: &mut BackupVault,
    ) -> Result<Option<Candidate>> {
        match source {
            Provenance::Learned => {
                let Some(learned) = self.store.lookup(sig) else {
                    return Ok(None);
                };
                debug!("learned store has a fix for {}", sig.short());
                Ok(Some(Candidate {
                    patch: Patch::new(learned.patch.clone(), Provenance::Learned, sig.clone()),
                    import_module: None,
                    pre_applied: false,
                }))
            }
            Provenance::Pattern => {
                let (outcome, contents) = self.pattern.try_fix(failure, vault)?;
                let Some((old, new)) = contents else {
                    debug!("pattern fixer: {}", outcome.reason);
                    return Ok(None);
                };
                let diff = full_file_diff(&failure.file, &old, &new);
                Ok(Some(Candidate {
                    patch: Patch::new(diff, Provenance::Pattern, sig.clone()),
                    import_module: outcome.module,
                    pre_applied: true,
                }))
            }
            Provenance::Oracle => {
                if !self.oracle.has_providers() {
                    return Ok(None);
                }
                let context = code_context(&self.project_root, failure);
                let request = OracleRequest {
                    error_message: &failure.message,
                    code_context: &context,
                    file_path: &failure.file,
                };
                let Some(suggestion) = self.oracle.suggest(sig, &request, &mut self.tracker)
                else {
                    return Ok(None);
                };
                Ok(Some(Candidate {
                    patch: Patch::new(suggestion.diff, Provenance::Oracle, sig.clone()),
                    import_module: None,
                    pre_applied: false,
                }))
            }
        }
    }

    /// Apply a patch through the vault. Returns Ok(false) when the diff was
    /// rejected; any files touched before the rejection are restored.
    fn apply_candidate(&mut self, vault: &mut BackupVault, patch: &Patch) -> Result<bool> {
        self.enter(SessionState::Applying);
        let diffs = match parse_patch(&patch.diff) {
            Ok(diffs) => diffs,
            Err(err) => {
                self.tracker.record_failed(
                    &patch.signature,
                    &patch.diff,
                    patch.provenance,
                    AttemptStatus::AppliedAndFailed,
                    &format!("unparseable diff: {}", err),
                )?;
                return Ok(false);
            }
        };

        let mut touched: Vec<PathBuf> = Vec::new();
        for file_diff in &diffs {
            let path = self.project_root.join(&file_diff.new_path);
            match apply_one(vault, &path, file_diff) {
                Ok(()) => touched.push(path),
                Err(err) => {
                    for p in touched.iter().rev() {
                        vault.restore(p)?;
                    }
                    self.tracker.record_failed(
                        &patch.signature,
                        &patch.diff,
                        patch.provenance,
                        AttemptStatus::AppliedAndFailed,
                        &format!("patch did not apply: {}", err),
                    )?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Re-run the executor, restricted to the failing file when supported.
    fn revalidate(&mut self, failure: &Failure) -> Result<bool> {
        self.enter(SessionState::Revalidating);
        let targets: Vec<PathBuf> = if self.executor.supports_targets() {
            vec![PathBuf::from(&failure.file)]
        } else {
            Vec::new()
        };
        let run = self.executor.run(&targets)?;
        if run.timed_out {
            debug!("revalidation timed out; treating as failure");
            return Ok(false);
        }
        if run.passed() {
            return Ok(true);
        }
        let failures = self.parser.parse(&run.combined());
        Ok(!failures
            .iter()
            .any(|f| f.file == failure.file && f.test == failure.test))
    }

    fn record_success(&mut self, candidate: &Candidate, sig: &ErrorSignature) -> Result<()> {
        self.tracker
            .record_successful(sig, &candidate.patch.diff, candidate.patch.provenance)?;
        if candidate.patch.provenance == Provenance::Learned {
            self.store.reinforce(sig)?;
        } else {
            self.store.upsert(sig, &candidate.patch.diff)?;
        }
        self.confidence.note_outcome(sig, true);
        if let Some(module) = &candidate.import_module {
            self.tracker.record_import_fix(module, true)?;
        }
        self.reporter.set_disposition(sig.as_str(), Disposition::Fixed);
        info!("fixed {} via {}", sig.short(), candidate.patch.provenance.name());
        Ok(())
    }

    /// Attempt budget is gone: re-try previously failed patches in reverse
    /// order (interaction bugs), then mark the signature for manual review.
    fn exhaust(
        &mut self,
        failure: &Failure,
        sig: &ErrorSignature,
        vault: &mut BackupVault,
    ) -> Result<Escalation> {
        let mut candidates = self.rollback.alternate_candidates(sig, &self.tracker);
        // A patch the confidence manager still nominates (threshold
        // inclusive) goes to the front of the retry order.
        if let Some(record) = self.confidence.best_high_confidence(sig) {
            if let Some(pos) = candidates.iter().position(|(diff, _)| *diff == record.patch) {
                let nominated = candidates.remove(pos);
                candidates.insert(0, nominated);
            }
        }
        for (diff, provenance) in candidates {
            if !self.rollback.take_retry(sig) {
                break;
            }
            let patch = Patch::new(diff, provenance, sig.clone());
            if !self.apply_candidate(vault, &patch)? {
                continue;
            }
            if self.revalidate(failure)? {
                let candidate = Candidate {
                    patch,
                    import_module: None,
                    pre_applied: true,
                };
                self.record_success(&candidate, sig)?;
                return Ok(Escalation::Fixed);
            }
            self.enter(SessionState::Reverting);
            self.rollback.revert_patch(
                &self.project_root,
                &patch,
                vault,
                &mut self.tracker,
                AttemptStatus::RolledBack,
                "alternate-order retry failed",
            )?;
            self.confidence.note_outcome(sig, false);
        }

        let reason = format!(
            "budget exhausted after {} attempt(s)",
            self.confidence.attempts(sig)
        );
        self.abandon_signature(sig, &reason);
        Ok(Escalation::Abandoned)
    }

    fn abandon_signature(&mut self, sig: &ErrorSignature, reason: &str) {
        self.enter(SessionState::Abandoning);
        self.rollback.abandon(sig, &mut self.tracker, reason);
        self.reporter.log_failed_patch(sig.as_str(), reason);
        self.reporter
            .set_disposition(sig.as_str(), Disposition::ManualReview);
    }

    fn enter(&mut self, next: SessionState) {
        if self.state != next {
            debug!("state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn apply_one(
    vault: &mut BackupVault,
    path: &Path,
    file_diff: &crate::patch::FileDiff,
) -> Result<()> {
    vault.ensure_backup(path)?;
    let original = fs::read_to_string(path)?;
    let patched = apply_file_diff(&original, file_diff).map_err(|e| anyhow::anyhow!(e))?;
    vault.write_through(path, &patched)?;
    Ok(())
}

/// Code context around the failing test, used for signatures and oracle
/// prompts. A window of the file around the first mention of the test name.
fn code_context(root: &Path, failure: &Failure) -> String {
    let path = root.join(&failure.file);
    let Ok(content) = fs::read_to_string(&path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let anchor = if failure.test.is_empty() {
        0
    } else {
        lines
            .iter()
            .position(|l| l.contains(failure.test.as_str()))
            .unwrap_or(0)
    };
    let start = anchor.saturating_sub(2);
    let end = (anchor + 3).min(lines.len());
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecOutput;
    use crate::tracker::AttemptStatus;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Executor that replays a script of outputs, then keeps returning the
    /// last one.
    struct ScriptedExecutor {
        script: RefCell<Vec<ExecOutput>>,
        last: RefCell<Option<ExecOutput>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<ExecOutput>) -> Self {
            Self {
                script: RefCell::new(script),
                last: RefCell::new(None),
            }
        }
    }

    impl TestExecutor for ScriptedExecutor {
        fn run(&self, _targets: &[PathBuf]) -> Result<ExecOutput> {
            let mut script = self.script.borrow_mut();
            let out = if script.is_empty() {
                self.last.borrow().clone().expect("script exhausted")
            } else {
                script.remove(0)
            };
            *self.last.borrow_mut() = Some(out.clone());
            Ok(out)
        }
    }

    struct FailingExecutor;

    impl TestExecutor for FailingExecutor {
        fn run(&self, _targets: &[PathBuf]) -> Result<ExecOutput> {
            anyhow::bail!("pytest binary not found")
        }
    }

    struct ScriptedOracle {
        replies: RefCell<Vec<Option<String>>>,
    }

    impl PatchOracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }

        fn suggest_patch(&self, _prompt: &str) -> Result<Option<String>> {
            let mut replies = self.replies.borrow_mut();
            if replies.is_empty() {
                Ok(None)
            } else {
                Ok(replies.remove(0))
            }
        }
    }

    fn passing() -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            timed_out: false,
        }
    }

    fn failing(line: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 1,
            stdout: line.to_string(),
            stderr: String::new(),
            duration_ms: 1,
            timed_out: false,
        }
    }

    fn test_config() -> Config {
        Config {
            jitter_seed: Some(7),
            validation_min_score: 0.0,
            ..Config::default()
        }
    }

    fn controller(
        root: &Path,
        config: Config,
        executor: Box<dyn TestExecutor>,
        providers: Vec<Box<dyn PatchOracle>>,
    ) -> Controller {
        Controller::new(root.to_path_buf(), config, executor, providers, None, None)
    }

    #[test]
    fn test_missing_attribute_quick_fix_end_to_end() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("target.py"),
            "class X: pass\n\ndef test_y():\n    X().y()\n",
        )
        .unwrap();
        let executor = ScriptedExecutor::new(vec![
            failing("FAILED target.py::test_y - AttributeError: 'X' object has no attribute 'y'"),
            passing(), // revalidation
            passing(), // next round confirms success
        ]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        let outcome = ctl.run_session().unwrap();
        assert_eq!(outcome, SessionOutcome::Success);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(ctl.state(), SessionState::Terminal);

        let after = fs::read_to_string(tmp.path().join("target.py")).unwrap();
        assert!(after.contains("class X:\n"));
        assert!(after.contains("def y(self): pass"));

        let data = config::data_dir(tmp.path());
        let tracker = PatchTracker::load(&data);
        let successes: Vec<_> = tracker
            .recent_attempts(10)
            .into_iter()
            .filter(|(_, o)| o.status == AttemptStatus::AppliedAndPassed)
            .collect();
        assert_eq!(successes.len(), 1);
        let store = LearnedFixStore::load(&data);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_import_error_quick_fix_end_to_end() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("target.py"),
            "def test_sqrt():\n    assert math.sqrt(4) == 2\n",
        )
        .unwrap();
        let executor = ScriptedExecutor::new(vec![
            failing("FAILED target.py::test_sqrt - ModuleNotFoundError: No module named 'math'"),
            passing(),
            passing(),
        ]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);

        let after = fs::read_to_string(tmp.path().join("target.py")).unwrap();
        assert!(after.starts_with("import math\n"));

        let tracker = PatchTracker::load(&config::data_dir(tmp.path()));
        let stats = tracker.import_fix_stats().get("math").unwrap();
        assert_eq!(stats.fixed, 1);
    }

    #[test]
    fn test_assertion_mismatch_rewrite_end_to_end() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("target.py"),
            "def test_eq():\n    assert 1 == 2\n",
        )
        .unwrap();
        let executor = ScriptedExecutor::new(vec![
            failing("FAILED target.py::test_eq - AssertionError: 1 != 2"),
            passing(),
            passing(),
        ]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);
        let after = fs::read_to_string(tmp.path().join("target.py")).unwrap();
        assert!(after.contains("assert 2 == 2"));
        assert!(!after.contains("assert 1 == 2"));
    }

    #[test]
    fn test_oracle_success_path() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("app.py"), "def run():\n    return 1\n").unwrap();
        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n def run():\n-    return 1\n+    return 2\n";
        let oracle = ScriptedOracle {
            replies: RefCell::new(vec![Some(diff.to_string())]),
        };
        let executor = ScriptedExecutor::new(vec![
            failing("FAILED app.py::test_run - RuntimeError: expected 2 got 1"),
            passing(),
            passing(),
        ]);
        let mut ctl = controller(
            tmp.path(),
            test_config(),
            Box::new(executor),
            vec![Box::new(oracle)],
        );
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);

        let after = fs::read_to_string(tmp.path().join("app.py")).unwrap();
        assert!(after.contains("return 2"));

        let tracker = PatchTracker::load(&config::data_dir(tmp.path()));
        let accepted: Vec<_> = tracker
            .oracle_feedback()
            .iter()
            .filter(|f| f.accepted)
            .collect();
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_retry_then_abandon_restores_files() {
        let tmp = TempDir::new().unwrap();
        let original = "def run():\n    return 1\n";
        fs::write(tmp.path().join("app.py"), original).unwrap();
        // The oracle keeps producing a patch that applies but never fixes.
        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n def run():\n-    return 1\n+    return 3\n";
        let oracle = ScriptedOracle {
            replies: RefCell::new(vec![
                Some(diff.to_string()),
                Some(diff.to_string()),
                Some(diff.to_string()),
            ]),
        };
        let failure_line = "FAILED app.py::test_run - RuntimeError: expected 2 got 1";
        let executor = ScriptedExecutor::new(vec![failing(failure_line)]);
        let mut ctl = controller(
            tmp.path(),
            test_config(),
            Box::new(executor),
            vec![Box::new(oracle)],
        );
        let outcome = ctl.run_session().unwrap();
        assert_eq!(outcome, SessionOutcome::Partial);
        assert_eq!(outcome.exit_code(), 1);

        // The failing file is back to its pre-session bytes.
        assert_eq!(
            fs::read_to_string(tmp.path().join("app.py")).unwrap(),
            original
        );

        let reporter = Reporter::load(&config::data_dir(tmp.path()));
        assert!(reporter
            .report()
            .dispositions
            .values()
            .any(|d| *d == Disposition::ManualReview));
    }

    #[test]
    fn test_no_patch_source_means_manual_review_without_mutation() {
        let tmp = TempDir::new().unwrap();
        let original = "def run():\n    return 1\n";
        fs::write(tmp.path().join("app.py"), original).unwrap();
        let executor = ScriptedExecutor::new(vec![failing(
            "FAILED app.py::test_run - RuntimeError: boom",
        )]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Partial);
        assert_eq!(
            fs::read_to_string(tmp.path().join("app.py")).unwrap(),
            original
        );
        let tracker = PatchTracker::load(&config::data_dir(tmp.path()));
        let manual: Vec<_> = tracker
            .recent_attempts(10)
            .into_iter()
            .filter(|(_, o)| o.status == AttemptStatus::ManualReview)
            .collect();
        assert_eq!(manual.len(), 1);
    }

    #[test]
    fn test_zero_attempt_budget_means_immediate_manual_review() {
        let tmp = TempDir::new().unwrap();
        let original = "def test_eq():\n    assert 1 == 2\n";
        fs::write(tmp.path().join("target.py"), original).unwrap();
        let mut config = test_config();
        config.max_attempts = 0;
        let executor = ScriptedExecutor::new(vec![failing(
            "FAILED target.py::test_eq - AssertionError: 1 != 2",
        )]);
        let mut ctl = controller(tmp.path(), config, Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Partial);
        // No mutation happened even though a pattern fix existed.
        assert_eq!(
            fs::read_to_string(tmp.path().join("target.py")).unwrap(),
            original
        );
        let reporter = Reporter::load(&config::data_dir(tmp.path()));
        assert!(reporter
            .report()
            .dispositions
            .values()
            .any(|d| *d == Disposition::ManualReview));
    }

    #[test]
    fn test_empty_output_with_zero_exit_is_success() {
        let tmp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new(vec![passing()]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);
    }

    #[test]
    fn test_unparseable_failing_output_aborts() {
        let tmp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new(vec![ExecOutput {
            exit_code: 1,
            stdout: "segfault in conftest".to_string(),
            stderr: String::new(),
            duration_ms: 1,
            timed_out: false,
        }]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        let outcome = ctl.run_session().unwrap();
        assert_eq!(outcome, SessionOutcome::Aborted);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn test_executor_error_aborts() {
        let tmp = TempDir::new().unwrap();
        let mut ctl = controller(tmp.path(), test_config(), Box::new(FailingExecutor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Aborted);
    }

    #[test]
    fn test_executor_death_mid_revalidation_aborts_and_restores() {
        let tmp = TempDir::new().unwrap();
        let original = "def test_eq():\n    assert 1 == 2\n";
        fs::write(tmp.path().join("target.py"), original).unwrap();

        struct Flaky {
            calls: RefCell<u32>,
        }
        impl TestExecutor for Flaky {
            fn run(&self, _targets: &[PathBuf]) -> Result<ExecOutput> {
                let mut calls = self.calls.borrow_mut();
                *calls += 1;
                if *calls == 1 {
                    Ok(failing("FAILED target.py::test_eq - AssertionError: 1 != 2"))
                } else {
                    anyhow::bail!("runner crashed")
                }
            }
        }

        let executor = Flaky {
            calls: RefCell::new(0),
        };
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        let outcome = ctl.run_session().unwrap();
        assert_eq!(outcome, SessionOutcome::Aborted);
        // The pattern fix had been applied before revalidation; the abort
        // restored the pre-session bytes.
        assert_eq!(
            fs::read_to_string(tmp.path().join("target.py")).unwrap(),
            original
        );
    }

    #[test]
    fn test_learned_fix_is_reused_next_session() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("target.py"),
            "def test_eq():\n    assert 1 == 2\n",
        )
        .unwrap();
        let failure_line = "FAILED target.py::test_eq - AssertionError: 1 != 2";
        // First session fixes via the pattern handler and learns the patch.
        let executor = ScriptedExecutor::new(vec![failing(failure_line), passing(), passing()]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);

        // Break the file the same way; the learned store now has the fix.
        fs::write(
            tmp.path().join("target.py"),
            "def test_eq():\n    assert 1 == 2\n",
        )
        .unwrap();
        let executor = ScriptedExecutor::new(vec![failing(failure_line), passing(), passing()]);
        let mut ctl = controller(tmp.path(), test_config(), Box::new(executor), vec![]);
        assert_eq!(ctl.run_session().unwrap(), SessionOutcome::Success);

        let data = config::data_dir(tmp.path());
        let tracker = PatchTracker::load(&data);
        let learned_successes: Vec<_> = tracker
            .recent_attempts(20)
            .into_iter()
            .filter(|(_, o)| {
                o.status == AttemptStatus::AppliedAndPassed
                    && o.provenance == Provenance::Learned
            })
            .collect();
        assert_eq!(learned_successes.len(), 1);
        let store = LearnedFixStore::load(&data);
        assert_eq!(store.len(), 1);
    }
}
