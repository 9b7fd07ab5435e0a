//! Commit-message trailer rewriting (C1, §4.1).
//!
//! Produces `Reviewed-by`, `Tested-by`, `Part-of`, and cherry-pick-footer
//! trailers and splices them onto a commit message idempotently: re-running
//! on an already-rewritten message must not duplicate a line (P3).

use crate::rest::User;

#[derive(Debug, Clone)]
pub struct TrailerOptions {
    pub add_reviewers: bool,
    pub add_tested: bool,
    pub add_part_of: bool,
    pub bot_name: String,
    pub bot_email: String,
}

/// Everything the rewriter needs to know about one commit's place in the
/// sequence being integrated, so only the *last* commit gets `Tested-by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPosition {
    Middle,
    Last,
}

/// Build the trailer block for a single commit. Reviewers are deduplicated
/// and sorted by username so output is deterministic across runs (needed
/// for P3: byte-identical on re-application).
pub fn build_trailers(
    opts: &TrailerOptions,
    reviewers: &[User],
    mr_iid: u64,
    mr_web_url: &str,
    position: CommitPosition,
    original_sha: Option<&str>,
) -> Vec<String> {
    let mut trailers = Vec::new();

    if opts.add_reviewers {
        let mut seen = std::collections::BTreeSet::new();
        for user in reviewers {
            let Some(email) = &user.email else {
                continue; // email resolution is admin-only; omit otherwise (§4.1)
            };
            let line = format!("Reviewed-by: {} <{}>", user.username, email);
            if seen.insert(line.clone()) {
                trailers.push(line);
            }
        }
    }

    if opts.add_tested && position == CommitPosition::Last {
        trailers.push(format!(
            "Tested-by: {} <{}> {mr_web_url}",
            opts.bot_name, opts.bot_email
        ));
    }

    if opts.add_part_of {
        trailers.push(format!("Part-of: <!{mr_iid}>"));
    }

    if let Some(sha) = original_sha {
        trailers.push(format!("(cherry picked from commit {sha})"));
    }

    trailers
}

/// Splice `trailers` onto `message`, skipping any trailer line already
/// present verbatim (idempotence, P3). New trailers are appended after a
/// blank-line-separated trailer block if one already exists, otherwise a
/// fresh block is started.
pub fn apply_trailers(message: &str, trailers: &[String]) -> String {
    let trimmed = message.trim_end_matches('\n');
    let existing: std::collections::HashSet<&str> = trimmed.lines().collect();

    let missing: Vec<&String> = trailers
        .iter()
        .filter(|line| !existing.contains(line.as_str()))
        .collect();

    if missing.is_empty() {
        return format!("{trimmed}\n");
    }

    let already_has_trailer_block = trimmed
        .lines()
        .last()
        .map(|line| is_trailer_line(line))
        .unwrap_or(false);

    let mut out = String::from(trimmed);
    if !already_has_trailer_block {
        out.push_str("\n\n");
    } else {
        out.push('\n');
    }
    for (i, line) in missing.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.push('\n');
    out
}

fn is_trailer_line(line: &str) -> bool {
    line.starts_with("Reviewed-by:")
        || line.starts_with("Tested-by:")
        || line.starts_with("Part-of:")
        || line.starts_with("(cherry picked from commit")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(username: &str, email: &str) -> User {
        User {
            id: 1,
            username: username.to_string(),
            email: Some(email.to_string()),
            is_admin: false,
        }
    }

    fn opts() -> TrailerOptions {
        TrailerOptions {
            add_reviewers: true,
            add_tested: true,
            add_part_of: true,
            bot_name: "mergetrain".to_string(),
            bot_email: "mergetrain@example.com".to_string(),
        }
    }

    #[test]
    fn tested_by_only_on_last_commit() {
        let trailers_middle = build_trailers(
            &opts(),
            &[],
            42,
            "https://example.com/mr/42",
            CommitPosition::Middle,
            None,
        );
        assert!(!trailers_middle.iter().any(|l| l.starts_with("Tested-by:")));

        let trailers_last = build_trailers(
            &opts(),
            &[],
            42,
            "https://example.com/mr/42",
            CommitPosition::Last,
            None,
        );
        assert!(trailers_last.iter().any(|l| l.starts_with("Tested-by:")));
    }

    #[test]
    fn reviewers_without_email_are_omitted() {
        let reviewer = User {
            id: 2,
            username: "noemail".to_string(),
            email: None,
            is_admin: false,
        };
        let trailers = build_trailers(
            &opts(),
            &[reviewer],
            1,
            "https://example.com/mr/1",
            CommitPosition::Middle,
            None,
        );
        assert!(!trailers.iter().any(|l| l.starts_with("Reviewed-by:")));
    }

    #[test]
    fn duplicate_reviewers_deduplicated() {
        let a = user("alice", "alice@example.com");
        let a_again = user("alice", "alice@example.com");
        let trailers = build_trailers(
            &opts(),
            &[a, a_again],
            1,
            "https://example.com/mr/1",
            CommitPosition::Middle,
            None,
        );
        let reviewed_by_count = trailers.iter().filter(|l| l.starts_with("Reviewed-by:")).count();
        assert_eq!(reviewed_by_count, 1);
    }

    #[test]
    fn apply_trailers_is_idempotent() {
        let message = "Fix the thing\n\nLonger description.\n";
        let trailers = vec!["Part-of: <!7>".to_string()];
        let once = apply_trailers(message, &trailers);
        let twice = apply_trailers(&once, &trailers);
        assert_eq!(once, twice, "re-applying trailers must not duplicate them (P3)");
    }

    #[test]
    fn apply_trailers_appends_to_existing_block() {
        let message = "Fix the thing\n\nReviewed-by: Bob <bob@example.com>\n";
        let trailers = vec![
            "Reviewed-by: Bob <bob@example.com>".to_string(),
            "Part-of: <!9>".to_string(),
        ];
        let result = apply_trailers(message, &trailers);
        assert_eq!(
            result,
            "Fix the thing\n\nReviewed-by: Bob <bob@example.com>\nPart-of: <!9>\n"
        );
    }

    #[test]
    fn apply_trailers_starts_fresh_block_when_none_exists() {
        let message = "Fix the thing\n";
        let trailers = vec!["Part-of: <!3>".to_string()];
        let result = apply_trailers(message, &trailers);
        assert_eq!(result, "Fix the thing\n\nPart-of: <!3>\n");
    }

    #[test]
    fn cherry_pick_footer_is_appended_when_present() {
        let trailers = build_trailers(
            &TrailerOptions {
                add_reviewers: false,
                add_tested: false,
                add_part_of: false,
                bot_name: "mergetrain".to_string(),
                bot_email: "mergetrain@example.com".to_string(),
            },
            &[],
            1,
            "https://example.com/mr/1",
            CommitPosition::Last,
            Some("abc1234"),
        );
        assert_eq!(trailers, vec!["(cherry picked from commit abc1234)".to_string()]);
    }
}
