//! Resumable Step Sequencer
//!
//! Runs an ordered list of named steps, persisting the name of the last
//! completed step after each success so that an interrupted or failed run
//! can be re-invoked and pick up where it stopped.
//!
//! # Run Contract
//!
//! ```text
//! load marker (absent -> persist START)
//!     ↓
//! resume index = position(marker) + 1   (START -> 0, unknown -> StaleState)
//!     ↓
//! for each remaining step, in declaration order:
//!     Done / Skipped  -> persist step name, continue
//!     Pause           -> stop, marker untouched   -> RunResult::Paused
//!     Err             -> stop, marker untouched   -> RunResult::Failed
//!     ↓
//! RunResult::Completed
//! ```
//!
//! Idempotence of the individual actions is their own business. The
//! sequencer only guarantees that a step whose completion was persisted is
//! never run again, and that a paused or failed step is attempted again on
//! the next invocation.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::marker::{Marker, MarkerError, MarkerStore, SENTINEL};

/// What a step action reports when it returns without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's work is done (or was already done)
    Done,

    /// A precondition was missing (e.g. no spare disk) and there is nothing
    /// to do. Persisted like `Done`; the run continues.
    Skipped { reason: String },

    /// The step needs the operator to act (e.g. log in again) before it can
    /// be confirmed. The step is retried in full on the next invocation.
    Pause { instruction: String },
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn pause(instruction: impl Into<String>) -> Self {
        Self::Pause {
            instruction: instruction.into(),
        }
    }
}

/// The fallible, side-effecting body of a step.
///
/// `C` is whatever the actions need to reach their collaborators. Plain
/// closures taking `&C` implement this trait.
pub trait StepAction<C: ?Sized> {
    fn execute(&self, ctx: &C) -> anyhow::Result<StepOutcome>;
}

impl<C: ?Sized, F> StepAction<C> for F
where
    F: Fn(&C) -> anyhow::Result<StepOutcome>,
{
    fn execute(&self, ctx: &C) -> anyhow::Result<StepOutcome> {
        self(ctx)
    }
}

/// A named unit of work.
pub struct Step<C: ?Sized> {
    name: String,
    description: String,
    action: Box<dyn StepAction<C>>,
}

impl<C: ?Sized> Step<C> {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        action: impl StepAction<C> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            action: Box::new(action),
        }
    }

    /// Unique name; this is the token persisted in the marker.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<C: ?Sized> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Errors that stop a run before or between steps.
///
/// A failing step action is not one of these; it is reported as
/// `RunResult::Failed`.
#[derive(Error, Debug)]
pub enum SequenceError {
    /// The persisted marker names no step in this sequence
    #[error(
        "Progress marker names unknown step '{marker}' (the step list changed since the last run; \
         inspect or reset the progress file)"
    )]
    StaleState { marker: String },

    #[error("Step sequence is empty")]
    EmptySequence,

    #[error("Step name '{name}' is declared more than once")]
    DuplicateStep { name: String },

    /// The name cannot be written to the marker and read back as itself
    #[error("Step name {name:?} is not a valid progress token: {reason}")]
    InvalidStepName { name: String, reason: &'static str },

    /// The marker store could not be read or written
    #[error(transparent)]
    Store(#[from] MarkerError),
}

/// Outcome of one `run` invocation.
#[derive(Debug)]
pub enum RunResult {
    /// Every remaining step finished; `executed` lists the steps run now
    Completed { executed: Vec<String> },

    /// `step` asked for operator action; the marker still points before it
    Paused { step: String, instruction: String },

    /// `step` failed; no later step ran and the marker was not advanced
    Failed { step: String, error: anyhow::Error },
}

impl RunResult {
    /// Process exit code for this result: 0 for completed or paused, 1 for failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } | Self::Paused { .. } => 0,
            Self::Failed { .. } => 1,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Ordered, immutable list of steps.
pub struct StepSequence<C: ?Sized> {
    steps: Vec<Step<C>>,
}

impl<C: ?Sized> fmt::Debug for StepSequence<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps.iter()).finish()
    }
}

impl<C: ?Sized> StepSequence<C> {
    /// Build a sequence, rejecting empty lists, repeated names and names
    /// the progress marker cannot hold.
    pub fn new(steps: Vec<Step<C>>) -> Result<Self, SequenceError> {
        if steps.is_empty() {
            return Err(SequenceError::EmptySequence);
        }

        let mut seen = HashSet::with_capacity(steps.len());
        for step in &steps {
            check_step_name(step.name())?;
            if !seen.insert(step.name()) {
                return Err(SequenceError::DuplicateStep {
                    name: step.name().to_string(),
                });
            }
        }

        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step<C>] {
        &self.steps
    }

    /// Step names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    /// Declaration index of `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    /// Index of the first step still to run for `marker`.
    ///
    /// Returns `len()` when the marker names the last step.
    ///
    /// # Errors
    ///
    /// `StaleState` if the marker names no step in this sequence.
    pub fn resume_index(&self, marker: &Marker) -> Result<usize, SequenceError> {
        match marker.step() {
            None => Ok(0),
            Some(name) => self
                .position(name)
                .map(|i| i + 1)
                .ok_or_else(|| SequenceError::StaleState {
                    marker: name.to_string(),
                }),
        }
    }

    /// Steps that a run starting from `marker` would attempt.
    pub fn plan(&self, marker: &Marker) -> Result<&[Step<C>], SequenceError> {
        let start = self.resume_index(marker)?;
        Ok(&self.steps[start..])
    }

    /// Execute the remaining steps against `ctx`, persisting progress in `store`.
    ///
    /// # Errors
    ///
    /// - `StaleState` before any step runs, if the marker is unknown
    /// - `Store` if the marker cannot be loaded or saved
    pub fn run(
        &self,
        ctx: &C,
        store: &mut dyn MarkerStore,
    ) -> Result<RunResult, SequenceError> {
        let marker = match store.load()? {
            Some(marker) => marker,
            None => {
                debug!("No progress marker yet, starting from the first step");
                store.save(&Marker::Start)?;
                Marker::Start
            }
        };

        let start = self.resume_index(&marker)?;
        if start < self.steps.len() {
            info!(
                "Resuming at step '{}' ({}/{}) after marker '{}'",
                self.steps[start].name(),
                start + 1,
                self.steps.len(),
                marker
            );
        } else {
            info!("All {} steps already completed", self.steps.len());
        }

        let mut executed = Vec::new();
        for (index, step) in self.steps.iter().enumerate().skip(start) {
            info!(
                "Running step '{}' ({}/{}): {}",
                step.name(),
                index + 1,
                self.steps.len(),
                step.description()
            );

            match step.action.execute(ctx) {
                Ok(StepOutcome::Done) => {
                    info!("Step '{}' completed", step.name());
                }
                Ok(StepOutcome::Skipped { reason }) => {
                    warn!("Step '{}' had nothing to do: {}", step.name(), reason);
                }
                Ok(StepOutcome::Pause { instruction }) => {
                    info!("Step '{}' paused for operator action", step.name());
                    return Ok(RunResult::Paused {
                        step: step.name().to_string(),
                        instruction,
                    });
                }
                Err(error) => {
                    warn!("Step '{}' failed: {:#}", step.name(), error);
                    return Ok(RunResult::Failed {
                        step: step.name().to_string(),
                        error,
                    });
                }
            }

            store.save(&Marker::completed(step.name()))?;
            executed.push(step.name().to_string());
        }

        Ok(RunResult::Completed { executed })
    }
}

fn check_step_name(name: &str) -> Result<(), SequenceError> {
    let reason = if name.is_empty() {
        "empty"
    } else if name == SENTINEL {
        "reserved for the not-started marker"
    } else if name.contains(char::is_whitespace) {
        "contains whitespace"
    } else {
        return Ok(());
    };
    Err(SequenceError::InvalidStepName {
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MemoryMarkerStore;
    use std::cell::RefCell;

    /// Records which actions ran, in order.
    #[derive(Default)]
    struct Journal {
        ran: RefCell<Vec<String>>,
    }

    impl Journal {
        fn ran(&self) -> Vec<String> {
            self.ran.borrow().clone()
        }
    }

    fn record(name: &'static str) -> impl Fn(&Journal) -> anyhow::Result<StepOutcome> {
        move |j: &Journal| -> anyhow::Result<StepOutcome> {
            j.ran.borrow_mut().push(name.to_string());
            Ok(StepOutcome::Done)
        }
    }

    fn abc() -> StepSequence<Journal> {
        StepSequence::new(vec![
            Step::new("A", "first", record("A")),
            Step::new("B", "second", record("B")),
            Step::new("C", "third", record("C")),
        ])
        .unwrap()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn test_empty_sequence_rejected() {
        let err = StepSequence::<Journal>::new(Vec::new()).unwrap_err();
        assert!(matches!(err, SequenceError::EmptySequence));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = StepSequence::new(vec![
            Step::new("A", "", record("A")),
            Step::new("A", "", record("A")),
        ])
        .unwrap_err();
        assert!(matches!(err, SequenceError::DuplicateStep { name } if name == "A"));
    }

    #[test]
    fn test_sentinel_name_rejected() {
        let err = StepSequence::new(vec![
            Step::new(SENTINEL, "", record("START")),
            Step::new("B", "", record("B")),
        ])
        .unwrap_err();
        assert!(matches!(err, SequenceError::InvalidStepName { ref name, .. } if name == "START"));
    }

    #[test]
    fn test_whitespace_and_empty_names_rejected() {
        for bad in ["install juju", "", "tab\tstep", "trailing\n"] {
            let err = StepSequence::new(vec![Step::new(bad, "", record("X"))]).unwrap_err();
            assert!(
                matches!(err, SequenceError::InvalidStepName { ref name, .. } if name == bad),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_every_accepted_name_round_trips_through_marker() {
        let seq = StepSequence::new(vec![
            Step::new("install-juju", "", record("A")),
            Step::new("start_lower", "", record("B")),
        ])
        .unwrap();
        for name in seq.names() {
            let marker = Marker::parse(Marker::completed(name).as_token()).unwrap();
            assert_eq!(marker.step(), Some(name));
        }
    }

    #[test]
    fn test_resume_index() {
        let seq = abc();
        assert_eq!(seq.resume_index(&Marker::Start).unwrap(), 0);
        assert_eq!(seq.resume_index(&Marker::completed("A")).unwrap(), 1);
        assert_eq!(seq.resume_index(&Marker::completed("C")).unwrap(), 3);
        assert!(matches!(
            seq.resume_index(&Marker::completed("Z")),
            Err(SequenceError::StaleState { .. })
        ));
    }

    #[test]
    fn test_plan_lists_remaining_steps() {
        let seq = abc();
        let names: Vec<&str> = seq
            .plan(&Marker::completed("A"))
            .unwrap()
            .iter()
            .map(Step::name)
            .collect();
        assert_eq!(names, vec!["B", "C"]);
        assert!(seq.plan(&Marker::completed("C")).unwrap().is_empty());
    }

    // =========================================================================
    // Run scenarios
    // =========================================================================

    #[test]
    fn test_fresh_run_executes_everything() {
        let seq = abc();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::new();

        let result = seq.run(&journal, &mut store).unwrap();

        assert!(result.is_completed());
        assert_eq!(journal.ran(), vec!["A", "B", "C"]);
        assert_eq!(store.current(), Some(&Marker::completed("C")));
        assert_eq!(store.history()[0], Marker::Start, "sentinel persisted first");
    }

    #[test]
    fn test_resume_after_marker() {
        let seq = abc();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::with_marker(Marker::completed("A"));

        let result = seq.run(&journal, &mut store).unwrap();

        match result {
            RunResult::Completed { executed } => assert_eq!(executed, vec!["B", "C"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(journal.ran(), vec!["B", "C"]);
        assert_eq!(store.current(), Some(&Marker::completed("C")));
    }

    #[test]
    fn test_rerun_after_completion_does_nothing() {
        let seq = abc();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::with_marker(Marker::completed("C"));

        let result = seq.run(&journal, &mut store).unwrap();

        assert!(result.is_completed());
        assert!(journal.ran().is_empty());
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_failure_stops_and_keeps_marker() {
        let seq = StepSequence::new(vec![
            Step::new("A", "", record("A")),
            Step::new("B", "", |j: &Journal| -> anyhow::Result<StepOutcome> {
                j.ran.borrow_mut().push("B".to_string());
                anyhow::bail!("snap exited with status 1")
            }),
            Step::new("C", "", record("C")),
        ])
        .unwrap();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::with_marker(Marker::completed("A"));

        let result = seq.run(&journal, &mut store).unwrap();

        match &result {
            RunResult::Failed { step, error } => {
                assert_eq!(step, "B");
                assert!(error.to_string().contains("status 1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(result.exit_code(), 1);
        assert_eq!(journal.ran(), vec!["B"]);
        assert_eq!(store.current(), Some(&Marker::completed("A")));
    }

    #[test]
    fn test_stale_marker_runs_nothing() {
        let seq = abc();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::with_marker(Marker::completed("Z"));

        let err = seq.run(&journal, &mut store).unwrap_err();

        assert!(matches!(err, SequenceError::StaleState { marker } if marker == "Z"));
        assert!(journal.ran().is_empty());
        assert_eq!(store.current(), Some(&Marker::completed("Z")));
    }

    #[test]
    fn test_pause_leaves_marker_before_paused_step() {
        let seq = StepSequence::new(vec![
            Step::new("A", "", record("A")),
            Step::new("B", "", |j: &Journal| -> anyhow::Result<StepOutcome> {
                j.ran.borrow_mut().push("B".to_string());
                Ok(StepOutcome::pause("log in again"))
            }),
            Step::new("C", "", record("C")),
        ])
        .unwrap();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::new();

        let result = seq.run(&journal, &mut store).unwrap();

        match &result {
            RunResult::Paused { step, instruction } => {
                assert_eq!(step, "B");
                assert_eq!(instruction, "log in again");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(result.exit_code(), 0);
        assert_eq!(journal.ran(), vec!["A", "B"]);
        assert_eq!(store.current(), Some(&Marker::completed("A")));
    }

    #[test]
    fn test_pause_on_first_step_keeps_sentinel() {
        let seq = StepSequence::new(vec![
            Step::new("A", "", |_: &Journal| -> anyhow::Result<StepOutcome> {
                Ok(StepOutcome::pause("wait"))
            }),
            Step::new("B", "", record("B")),
        ])
        .unwrap();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::new();

        let result = seq.run(&journal, &mut store).unwrap();

        assert!(matches!(result, RunResult::Paused { .. }));
        assert_eq!(store.current(), Some(&Marker::Start));
    }

    #[test]
    fn test_skipped_step_is_persisted_and_run_continues() {
        let seq = StepSequence::new(vec![
            Step::new("A", "", |_: &Journal| -> anyhow::Result<StepOutcome> {
                Ok(StepOutcome::skipped("no disk"))
            }),
            Step::new("B", "", record("B")),
        ])
        .unwrap();
        let journal = Journal::default();
        let mut store = MemoryMarkerStore::new();

        let result = seq.run(&journal, &mut store).unwrap();

        assert!(result.is_completed());
        assert_eq!(journal.ran(), vec!["B"]);
        assert_eq!(
            store.history(),
            &[
                Marker::Start,
                Marker::completed("A"),
                Marker::completed("B")
            ]
        );
    }

    #[test]
    fn test_stale_error_display() {
        let err = SequenceError::StaleState {
            marker: "Z".to_string(),
        };
        assert!(err.to_string().contains("unknown step 'Z'"));
    }
}
