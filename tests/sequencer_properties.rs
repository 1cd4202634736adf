//! Property-based tests for the step sequencer
//!
//! These tests verify, for arbitrary step lists and starting markers:
//! - Resumption: only steps after the marker run, in order
//! - Monotonic marker advance: the marker never moves backwards
//! - Fail-stop and pause-retry: nothing after a failing or pausing step runs
//!   and the marker stays on the step before it
//! - Stale marker detection before any step runs

use std::cell::RefCell;

use mlnode::{
    FileMarkerStore, Marker, MarkerStore, MemoryMarkerStore, RunResult, SequenceError, Step,
    StepOutcome, StepSequence,
};
use proptest::prelude::*;
use tempfile::TempDir;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Done,
    Skip,
    Pause,
    Fail,
}

impl Behaviour {
    /// Whether the sequencer stops at a step behaving like this.
    fn stops(self) -> bool {
        matches!(self, Self::Pause | Self::Fail)
    }
}

fn behaviour_strategy() -> impl Strategy<Value = Behaviour> {
    prop_oneof![
        6 => Just(Behaviour::Done),
        2 => Just(Behaviour::Skip),
        1 => Just(Behaviour::Pause),
        1 => Just(Behaviour::Fail),
    ]
}

fn step_name(index: usize) -> String {
    format!("step-{}", index)
}

/// Marker value meaning "the first `completed` steps are done".
fn marker_after(completed: usize) -> Marker {
    match completed {
        0 => Marker::Start,
        n => Marker::completed(step_name(n - 1)),
    }
}

fn names(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(step_name).collect()
}

fn sequence_of(behaviours: &[Behaviour]) -> StepSequence<Journal> {
    let steps = behaviours
        .iter()
        .enumerate()
        .map(|(index, behaviour)| {
            let name = step_name(index);
            let behaviour = *behaviour;
            let label = name.clone();
            Step::new(
                name,
                "generated step",
                move |journal: &Journal| -> anyhow::Result<StepOutcome> {
                    journal.ran.borrow_mut().push(label.clone());
                    match behaviour {
                        Behaviour::Done => Ok(StepOutcome::Done),
                        Behaviour::Skip => Ok(StepOutcome::skipped("nothing attached")),
                        Behaviour::Pause => Ok(StepOutcome::pause("log in again")),
                        Behaviour::Fail => anyhow::bail!("{} exploded", label),
                    }
                },
            )
        })
        .collect();
    StepSequence::new(steps).expect("generated names are unique")
}

/// A behaviour list plus how many of its steps are already completed.
fn scenario() -> impl Strategy<Value = (Vec<Behaviour>, usize)> {
    prop::collection::vec(behaviour_strategy(), 1..10).prop_flat_map(|behaviours| {
        let len = behaviours.len();
        (Just(behaviours), 0..=len)
    })
}

fn position(sequence: &StepSequence<Journal>, marker: &Marker) -> usize {
    sequence
        .resume_index(marker)
        .expect("marker produced by the sequence itself")
}

// =============================================================================
// Resumption, monotonicity, fail-stop, pause-retry
// =============================================================================

proptest! {
    /// A clean sequence resumed after any prefix runs exactly the suffix
    #[test]
    fn resumes_after_completed_prefix(len in 1usize..10, seed in any::<prop::sample::Index>()) {
        let completed = seed.index(len + 1);
        let sequence = sequence_of(&vec![Behaviour::Done; len]);
        let mut store = MemoryMarkerStore::with_marker(marker_after(completed));
        let journal = Journal::default();

        let result = sequence.run(&journal, &mut store).unwrap();

        prop_assert_eq!(journal.ran(), names(completed..len));
        match result {
            RunResult::Completed { executed } => prop_assert_eq!(executed, names(completed..len)),
            other => prop_assert!(false, "expected Completed, got {:?}", other),
        }
        prop_assert_eq!(store.current(), Some(&marker_after(len)));
    }

    /// Whatever the steps do, the run stops at the first pause or failure,
    /// the marker ends right before it, and never moves backwards
    #[test]
    fn stops_at_first_pause_or_failure((behaviours, completed) in scenario()) {
        let sequence = sequence_of(&behaviours);
        let before = marker_after(completed);
        let mut store = MemoryMarkerStore::with_marker(before.clone());
        let journal = Journal::default();

        let result = sequence.run(&journal, &mut store).unwrap();

        let stop = (completed..behaviours.len()).find(|&i| behaviours[i].stops());
        let after = store.current().cloned().unwrap();
        match stop {
            Some(index) => {
                prop_assert_eq!(journal.ran(), names(completed..index + 1));
                prop_assert_eq!(&after, &marker_after(index));
                match (&result, behaviours[index]) {
                    (RunResult::Paused { step, .. }, Behaviour::Pause) => {
                        prop_assert_eq!(step, &step_name(index));
                    }
                    (RunResult::Failed { step, .. }, Behaviour::Fail) => {
                        prop_assert_eq!(step, &step_name(index));
                    }
                    (other, expected) => {
                        prop_assert!(false, "expected {:?} result, got {:?}", expected, other);
                    }
                }
            }
            None => {
                prop_assert_eq!(journal.ran(), names(completed..behaviours.len()));
                prop_assert!(result.is_completed());
                prop_assert_eq!(&after, &marker_after(behaviours.len()));
            }
        }

        prop_assert!(position(&sequence, &after) >= position(&sequence, &before));
        // Every saved value is a forward move, one step at a time
        let mut last = position(&sequence, &before);
        for saved in store.history() {
            let next = position(&sequence, saved);
            prop_assert_eq!(next, last + 1);
            last = next;
        }
    }

    /// Re-invoking after a stop retries the stopping step first
    #[test]
    fn rerun_retries_stopped_step((behaviours, completed) in scenario()) {
        let sequence = sequence_of(&behaviours);
        let mut store = MemoryMarkerStore::with_marker(marker_after(completed));

        let first = Journal::default();
        let result = sequence.run(&first, &mut store).unwrap();
        prop_assume!(!result.is_completed());
        let stopped_at = first.ran().last().cloned().unwrap();

        let second = Journal::default();
        sequence.run(&second, &mut store).unwrap();
        let second_ran = second.ran();
        prop_assert_eq!(second_ran.first(), Some(&stopped_at));
    }

    /// A marker naming no known step aborts before any action runs
    #[test]
    fn stale_marker_runs_nothing(
        behaviours in prop::collection::vec(behaviour_strategy(), 1..10),
        token in "[a-z][a-z0-9-]{0,12}",
    ) {
        prop_assume!(!token.starts_with("step-"));
        let sequence = sequence_of(&behaviours);
        let stale = Marker::completed(format!("gone-{}", token));
        let mut store = MemoryMarkerStore::with_marker(stale.clone());
        let journal = Journal::default();

        let err = sequence.run(&journal, &mut store).unwrap_err();

        let is_stale = matches!(err, SequenceError::StaleState { .. });
        prop_assert!(is_stale);
        prop_assert!(journal.ran().is_empty());
        prop_assert_eq!(store.current(), Some(&stale));
        prop_assert!(store.history().is_empty());
    }

    /// Any name the sequence accepts reads back from the marker file as itself
    #[test]
    fn accepted_names_survive_the_marker_file(name in "[ -~\t]{0,12}") {
        let step = Step::new(
            name.clone(),
            "generated step",
            |_: &Journal| -> anyhow::Result<StepOutcome> { Ok(StepOutcome::Done) },
        );
        match StepSequence::new(vec![step]) {
            Ok(sequence) => {
                let dir = TempDir::new().unwrap();
                let mut store = FileMarkerStore::new(dir.path().join("progress"));
                store.save(&Marker::completed(name.clone())).unwrap();
                let loaded = store.load().unwrap().unwrap();
                prop_assert_eq!(loaded.step(), Some(name.as_str()));
                prop_assert_eq!(sequence.resume_index(&loaded).unwrap(), 1);
            }
            Err(err) => {
                let is_invalid = matches!(err, SequenceError::InvalidStepName { .. });
                prop_assert!(is_invalid);
            }
        }
    }
}

// =============================================================================
// Scenarios on [A, B, C]
// =============================================================================

fn abc(b: Behaviour) -> StepSequence<Journal> {
    let steps = ["A", "B", "C"]
        .into_iter()
        .map(|name| {
            let behaviour = if name == "B" { b } else { Behaviour::Done };
            Step::new(
                name,
                "scenario step",
                move |journal: &Journal| -> anyhow::Result<StepOutcome> {
                    journal.ran.borrow_mut().push(name.to_string());
                    match behaviour {
                        Behaviour::Pause => Ok(StepOutcome::pause("re-login")),
                        Behaviour::Fail => anyhow::bail!("B failed"),
                        _ => Ok(StepOutcome::Done),
                    }
                },
            )
        })
        .collect();
    StepSequence::new(steps).unwrap()
}

#[test]
fn test_fresh_run_executes_everything() {
    let mut store = MemoryMarkerStore::new();
    let journal = Journal::default();

    let result = abc(Behaviour::Done).run(&journal, &mut store).unwrap();

    assert!(result.is_completed());
    assert_eq!(journal.ran(), vec!["A", "B", "C"]);
    assert_eq!(store.load().unwrap(), Some(Marker::completed("C")));
}

#[test]
fn test_resume_after_a() {
    let mut store = MemoryMarkerStore::with_marker(Marker::completed("A"));
    let journal = Journal::default();

    abc(Behaviour::Done).run(&journal, &mut store).unwrap();

    assert_eq!(journal.ran(), vec!["B", "C"]);
    assert_eq!(store.current(), Some(&Marker::completed("C")));
}

#[test]
fn test_failure_at_b_keeps_marker_at_a() {
    let mut store = MemoryMarkerStore::with_marker(Marker::completed("A"));
    let journal = Journal::default();

    let result = abc(Behaviour::Fail).run(&journal, &mut store).unwrap();

    assert_eq!(journal.ran(), vec!["B"]);
    assert_eq!(result.exit_code(), 1);
    match result {
        RunResult::Failed { step, error } => {
            assert_eq!(step, "B");
            assert!(error.to_string().contains("B failed"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(store.current(), Some(&Marker::completed("A")));
}

#[test]
fn test_unknown_marker_is_stale() {
    let mut store = MemoryMarkerStore::with_marker(Marker::completed("Z"));
    let journal = Journal::default();

    let err = abc(Behaviour::Done).run(&journal, &mut store).unwrap_err();

    assert!(matches!(err, SequenceError::StaleState { ref marker } if marker == "Z"));
    assert!(journal.ran().is_empty());
}

#[test]
fn test_pause_at_b_keeps_marker_at_a() {
    let mut store = MemoryMarkerStore::with_marker(Marker::completed("A"));
    let journal = Journal::default();

    let result = abc(Behaviour::Pause).run(&journal, &mut store).unwrap();

    assert_eq!(journal.ran(), vec!["B"]);
    assert_eq!(result.exit_code(), 0);
    assert!(matches!(result, RunResult::Paused { ref step, .. } if step == "B"));
    assert_eq!(store.current(), Some(&Marker::completed("A")));
}
