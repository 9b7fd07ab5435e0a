//! Shared capability interfaces consumed by both the single job and the
//! batch job (Design Notes §9: "factor shared behaviors... into capability
//! interfaces consumed by both jobs; the two jobs differ only in *how
//! many* MRs they fuse before waiting").

pub mod batch;
pub mod single;

use crate::rest::MergeRequest;

/// The three outcomes of VALIDATE (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// WIP, blocking label, a disallowed merge method, unresolved
    /// discussions, or insufficient approvals: unassign with an
    /// explanatory comment.
    Soft(String),
    /// Outside the allowed weekly interval: leave the MR assigned and take
    /// no action — the window recurs, so this is not the MR's fault (§8
    /// Scenario 6).
    Waiting(String),
    /// Closed or assigned to someone else: unassign silently.
    Hard,
}

/// Pure validation gate shared by both jobs (§4.5 REFETCH→VALIDATE). Takes
/// a point-in-time `mr` plus ambient policy and returns `None` when the MR
/// is eligible to proceed to fusion.
pub fn validate(
    mr: &MergeRequest,
    bot_user_id: u64,
    blocking_labels: &[String],
    inside_allowed_interval: bool,
    approvals_sufficient: bool,
    require_discussions_resolved: bool,
    merge_method_allowed: bool,
) -> Option<ValidationFailure> {
    if !mr.is_open() {
        return Some(ValidationFailure::Hard);
    }
    if mr.assignee_id != Some(bot_user_id) {
        return Some(ValidationFailure::Hard);
    }
    if mr.work_in_progress {
        return Some(ValidationFailure::Soft("marked work in progress".to_string()));
    }
    if !merge_method_allowed {
        return Some(ValidationFailure::Soft(
            "project's merge method is not in allow_merge_strategies".to_string(),
        ));
    }
    if require_discussions_resolved && !mr.blocking_discussions_resolved {
        return Some(ValidationFailure::Soft("unresolved discussions".to_string()));
    }
    if let Some(label) = mr.labels.iter().find(|l| blocking_labels.contains(l)) {
        return Some(ValidationFailure::Soft(format!("blocked by label '{label}'")));
    }
    if !approvals_sufficient {
        return Some(ValidationFailure::Soft("insufficient approvals".to_string()));
    }
    if !inside_allowed_interval {
        return Some(ValidationFailure::Waiting(
            "outside the configured allowed merge window".to_string(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::MergeRequestState;

    fn mr() -> MergeRequest {
        MergeRequest {
            project_id: 1,
            iid: 1,
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            source_project_id: 1,
            sha: "abc123".to_string(),
            assignee_id: Some(99),
            labels: vec![],
            approvals: Default::default(),
            work_in_progress: false,
            squash: false,
            web_url: "https://example.com/mr/1".to_string(),
            title: "Add thing".to_string(),
            description: String::new(),
            state: MergeRequestState::Opened,
            blocking_discussions_resolved: true,
        }
    }

    #[test]
    fn passes_when_everything_is_fine() {
        assert_eq!(validate(&mr(), 99, &[], true, true, true, true), None);
    }

    #[test]
    fn closed_mr_fails_hard() {
        let mut m = mr();
        m.state = MergeRequestState::Closed;
        assert_eq!(
            validate(&m, 99, &[], true, true, true, true),
            Some(ValidationFailure::Hard)
        );
    }

    #[test]
    fn foreign_assignee_fails_hard() {
        let mut m = mr();
        m.assignee_id = Some(1);
        assert_eq!(
            validate(&m, 99, &[], true, true, true, true),
            Some(ValidationFailure::Hard)
        );
    }

    #[test]
    fn wip_fails_soft() {
        let mut m = mr();
        m.work_in_progress = true;
        assert!(matches!(
            validate(&m, 99, &[], true, true, true, true),
            Some(ValidationFailure::Soft(_))
        ));
    }

    #[test]
    fn blocking_label_fails_soft() {
        let mut m = mr();
        m.labels = vec!["do-not-merge".to_string()];
        let failure = validate(&m, 99, &["do-not-merge".to_string()], true, true, true, true);
        assert!(matches!(failure, Some(ValidationFailure::Soft(_))));
    }

    #[test]
    fn unresolved_discussions_fail_soft_when_required() {
        let mut m = mr();
        m.blocking_discussions_resolved = false;
        assert!(matches!(
            validate(&m, 99, &[], true, true, true, true),
            Some(ValidationFailure::Soft(_))
        ));
    }

    #[test]
    fn unresolved_discussions_pass_when_not_required() {
        let mut m = mr();
        m.blocking_discussions_resolved = false;
        assert_eq!(validate(&m, 99, &[], true, true, false, true), None);
    }

    #[test]
    fn disallowed_merge_method_fails_soft() {
        assert!(matches!(
            validate(&mr(), 99, &[], true, true, true, false),
            Some(ValidationFailure::Soft(_))
        ));
    }

    #[test]
    fn outside_interval_waits_instead_of_failing() {
        assert!(matches!(
            validate(&mr(), 99, &[], false, true, true, true),
            Some(ValidationFailure::Waiting(_))
        ));
    }

    #[test]
    fn interval_checked_last_behind_real_failures() {
        // A blocking label outside the interval is still a Soft failure,
        // not Waiting: genuine problems take priority over the recurring
        // window closing.
        let mut m = mr();
        m.labels = vec!["do-not-merge".to_string()];
        let failure = validate(&m, 99, &["do-not-merge".to_string()], false, true, true, true);
        assert!(matches!(failure, Some(ValidationFailure::Soft(_))));
    }
}
