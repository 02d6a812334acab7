use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A request, extracted from an agent's output, asking another agent to
/// perform a sub-task. Immutable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// The agent being asked to perform the sub-task.
    pub target_agent: String,
    /// The sub-task text.
    pub task: String,
    /// The agent whose output contained the marker.
    pub delegating_agent: String,
}

/// Scans free text for `@agentName <task…>` delegation markers.
///
/// Each marker starts a new request whose task text runs to the next
/// marker or end of input. Multiple delegations to the same target are
/// preserved as distinct ordered requests: a coordinator may legitimately
/// ask one worker for several independent sub-tasks in a single response,
/// and each must be executed and reported separately.
pub struct DelegationParser {
    marker: Regex,
}

impl DelegationParser {
    /// Creates a parser.
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            marker: Regex::new(r"@([A-Za-z][A-Za-z0-9_-]*)").expect("static delegation pattern"),
        }
    }

    /// Extracts delegation requests from `text`, in order of appearance.
    pub fn parse(&self, text: &str, delegating_agent: &str) -> Vec<DelegationRequest> {
        // A marker only counts at the start of input or after whitespace,
        // so `user@example.com` is not a delegation.
        let markers: Vec<(usize, usize, &str)> = self
            .marker
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let name = caps.get(1)?;
                let preceded_ok = whole.start() == 0
                    || text[..whole.start()]
                        .chars()
                        .next_back()
                        .is_some_and(char::is_whitespace);
                preceded_ok.then(|| (whole.start(), whole.end(), name.as_str()))
            })
            .collect();

        let mut requests = Vec::new();
        for (position, &(_, task_start, target)) in markers.iter().enumerate() {
            let task_end = markers
                .get(position + 1)
                .map_or(text.len(), |next| next.0);
            let task = text[task_start..task_end].trim();
            if task.is_empty() {
                warn!(target = %target, "ignoring delegation marker with no task text");
                continue;
            }
            requests.push(DelegationRequest {
                target_agent: target.to_string(),
                task: task.to_string(),
                delegating_agent: delegating_agent.to_string(),
            });
        }
        requests
    }
}

impl Default for DelegationParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_markers_yields_nothing() {
        let parser = DelegationParser::new();
        assert!(parser.parse("All done, nothing to hand off.", "lead").is_empty());
    }

    #[test]
    fn test_single_delegation() {
        let parser = DelegationParser::new();
        let requests = parser.parse(
            "I need help with the data.\n@analyst Crunch the Q3 numbers.",
            "lead",
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target_agent, "analyst");
        assert_eq!(requests[0].task, "Crunch the Q3 numbers.");
        assert_eq!(requests[0].delegating_agent, "lead");
    }

    #[test]
    fn test_duplicate_targets_stay_distinct_and_ordered() {
        let parser = DelegationParser::new();
        let requests = parser.parse("@a Do X.\n@a Do Y.\n@a Do Z.", "coordinator");
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(request.target_agent, "a");
        }
        assert_eq!(requests[0].task, "Do X.");
        assert_eq!(requests[1].task, "Do Y.");
        assert_eq!(requests[2].task, "Do Z.");
    }

    #[test]
    fn test_multiple_targets_in_order() {
        let parser = DelegationParser::new();
        let requests = parser.parse(
            "Plan ready. @coder Implement the parser. @tester Write edge-case tests.",
            "lead",
        );
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].target_agent, "coder");
        assert_eq!(requests[0].task, "Implement the parser.");
        assert_eq!(requests[1].target_agent, "tester");
        assert_eq!(requests[1].task, "Write edge-case tests.");
    }

    #[test]
    fn test_task_spans_lines_until_next_marker() {
        let parser = DelegationParser::new();
        let requests = parser.parse(
            "@writer Draft the intro.\nKeep it short.\n@editor Review the draft.",
            "lead",
        );
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].task, "Draft the intro.\nKeep it short.");
    }

    #[test]
    fn test_email_address_is_not_a_delegation() {
        let parser = DelegationParser::new();
        let requests = parser.parse("Contact support@example.com for access.", "lead");
        assert!(requests.is_empty());
    }

    #[test]
    fn test_marker_without_task_is_ignored() {
        let parser = DelegationParser::new();
        let requests = parser.parse("Ping @reviewer", "lead");
        assert!(requests.is_empty());
    }
}
