//! Model-based coverage for VALIDATE's decision table (§4.5): every flag
//! that feeds `job::validate` is toggled independently and in every order,
//! and after each toggle the real function's classification is checked
//! against a reference model that encodes the same priority order by hand.
//!
//! The full async `JobState` machine isn't modeled here — `validate` is the
//! pure, synchronous core of it, and toggling its inputs one at a time is
//! enough to pin down the priority order the review caught drifting
//! (interval vs. label, in particular) without dragging a fake REST client
//! and tokio runtime into a property test.

use mergetrain::job::{validate, ValidationFailure};
use mergetrain::rest::{Approval, MergeRequest, MergeRequestState};
use proptest::prelude::*;
use proptest_state_machine::{prop_state_machine, ReferenceStateMachine, StateMachineTest};

const BOT_USER_ID: u64 = 99;
const BLOCKING_LABEL: &str = "do-not-merge";

/// The flags `validate` decides on, flattened into a single bag so the
/// reference model and the constructed `MergeRequest` can be derived from
/// the same source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Flags {
    open: bool,
    assigned_to_bot: bool,
    work_in_progress: bool,
    merge_method_allowed: bool,
    discussions_resolved: bool,
    blocking_label: bool,
    approved: bool,
    inside_interval: bool,
}

impl Flags {
    fn all_clear() -> Self {
        Flags {
            open: true,
            assigned_to_bot: true,
            work_in_progress: false,
            merge_method_allowed: true,
            discussions_resolved: true,
            blocking_label: false,
            approved: true,
            inside_interval: true,
        }
    }

    /// Mirrors `validate`'s own priority order exactly: open, then
    /// assignee, then WIP, then merge method, then discussions, then
    /// label, then approvals, then interval.
    fn expected(&self) -> Option<Kind> {
        if !self.open || !self.assigned_to_bot {
            return Some(Kind::Hard);
        }
        if self.work_in_progress {
            return Some(Kind::Soft);
        }
        if !self.merge_method_allowed {
            return Some(Kind::Soft);
        }
        if !self.discussions_resolved {
            return Some(Kind::Soft);
        }
        if self.blocking_label {
            return Some(Kind::Soft);
        }
        if !self.approved {
            return Some(Kind::Soft);
        }
        if !self.inside_interval {
            return Some(Kind::Waiting);
        }
        None
    }

    fn to_mr(&self) -> MergeRequest {
        MergeRequest {
            project_id: 1,
            iid: 1,
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            source_project_id: 1,
            sha: "abc123".to_string(),
            assignee_id: if self.assigned_to_bot { Some(BOT_USER_ID) } else { Some(1) },
            labels: if self.blocking_label { vec![BLOCKING_LABEL.to_string()] } else { vec![] },
            approvals: if self.approved {
                Approval { approved_by: vec![1] }
            } else {
                Approval::default()
            },
            work_in_progress: self.work_in_progress,
            squash: false,
            web_url: "https://example.com/mr/1".to_string(),
            title: "Add thing".to_string(),
            description: String::new(),
            state: if self.open { MergeRequestState::Opened } else { MergeRequestState::Closed },
            blocking_discussions_resolved: self.discussions_resolved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Hard,
    Soft,
    Waiting,
}

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Open,
    Assigned,
    Wip,
    MergeMethod,
    Discussions,
    Label,
    Approved,
    Interval,
}

const ALL_TOGGLES: [Toggle; 8] = [
    Toggle::Open,
    Toggle::Assigned,
    Toggle::Wip,
    Toggle::MergeMethod,
    Toggle::Discussions,
    Toggle::Label,
    Toggle::Approved,
    Toggle::Interval,
];

struct RefMachine;

impl ReferenceStateMachine for RefMachine {
    type State = Flags;
    type Transition = Toggle;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Flags::all_clear()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop::sample::select(&ALL_TOGGLES[..]).boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Toggle::Open => state.open = !state.open,
            Toggle::Assigned => state.assigned_to_bot = !state.assigned_to_bot,
            Toggle::Wip => state.work_in_progress = !state.work_in_progress,
            Toggle::MergeMethod => state.merge_method_allowed = !state.merge_method_allowed,
            Toggle::Discussions => state.discussions_resolved = !state.discussions_resolved,
            Toggle::Label => state.blocking_label = !state.blocking_label,
            Toggle::Approved => state.approved = !state.approved,
            Toggle::Interval => state.inside_interval = !state.inside_interval,
        }
        state
    }
}

struct ValidateUnderTest;

impl StateMachineTest for ValidateUnderTest {
    type SystemUnderTest = ValidateUnderTest;
    type Reference = RefMachine;

    fn init_test(_ref_state: &Flags) -> Self::SystemUnderTest {
        ValidateUnderTest
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &Flags,
        _transition: Toggle,
    ) -> Self::SystemUnderTest {
        let mr = ref_state.to_mr();
        let blocking_labels = vec![BLOCKING_LABEL.to_string()];
        let actual = validate(
            &mr,
            BOT_USER_ID,
            &blocking_labels,
            ref_state.inside_interval,
            ref_state.approved,
            ref_state.discussions_resolved,
            ref_state.merge_method_allowed,
        );

        let expected = ref_state.expected();
        match (expected, &actual) {
            (None, None) => {}
            (Some(Kind::Hard), Some(ValidationFailure::Hard)) => {}
            (Some(Kind::Soft), Some(ValidationFailure::Soft(_))) => {}
            (Some(Kind::Waiting), Some(ValidationFailure::Waiting(_))) => {}
            (expected, actual) => panic!(
                "validate() diverged from the reference model: flags={ref_state:?} expected={expected:?} actual={actual:?}"
            ),
        }

        state
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig::with_cases(256))]
    #[test]
    fn validate_matches_reference_model(sequential 1..16 => ValidateUnderTest);
}
