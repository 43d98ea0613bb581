// ABOUTME: Parsing of agent responses: fenced bash command blocks, completion signals and manager decisions

use lazy_static::lazy_static;
use regex::Regex;

/// More blocks than this in one response are dropped.
pub const MAX_COMMAND_BLOCKS: usize = 100;

/// Command output fed back to the agent is cut at this many characters.
pub const MAX_OUTPUT_CHARS: usize = 2000;

pub const TASK_COMPLETE: &str = "TASK_COMPLETE";
pub const QA_PASSED: &str = "QA_PASSED";
pub const QA_FAILED: &str = "QA_FAILED";

lazy_static! {
    static ref BASH_BLOCK: Regex = Regex::new(r"(?s)```bash\s*(.*?)\s*```").unwrap();
    static ref DECISION: Regex =
        Regex::new(r"(?m)^\s*DECISION:\s*(CONTINUE|COMPLETE|ABORT)\b[ \t]*(.*)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBlock {
    Script(String),
    /// JSON data someone fenced as bash; never executed.
    Json(String),
}

/// Fenced ```bash blocks in order of appearance, empty ones dropped.
pub fn extract_command_blocks(response: &str) -> Vec<CommandBlock> {
    BASH_BLOCK
        .captures_iter(response)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|script| !script.is_empty())
        .take(MAX_COMMAND_BLOCKS)
        .map(|script| {
            if is_json_data(script) {
                CommandBlock::Json(script.to_string())
            } else {
                CommandBlock::Script(script.to_string())
            }
        })
        .collect()
}

pub fn count_command_blocks(response: &str) -> usize {
    BASH_BLOCK.captures_iter(response).count()
}

fn is_json_data(script: &str) -> bool {
    (script.starts_with('{') || script.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(script).is_ok()
}

pub fn truncate_output(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let head: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{}\n... [Output Truncated. Total length: {} chars] ...", head, total)
}

/// True when `signal` appears alone on a line.
pub fn has_signal(text: &str, signal: &str) -> bool {
    text.lines().any(|line| line.trim() == signal)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerDecision {
    Continue,
    Complete,
    Abort(String),
}

/// The first `DECISION:` line wins; without one the manager lets work continue.
pub fn parse_manager_decision(response: &str) -> ManagerDecision {
    let Some(caps) = DECISION.captures(response) else {
        return ManagerDecision::Continue;
    };
    let reason = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
    match &caps[1] {
        "COMPLETE" => ManagerDecision::Complete,
        "ABORT" => ManagerDecision::Abort(if reason.is_empty() {
            "no reason given".to_string()
        } else {
            reason
        }),
        _ => ManagerDecision::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extracts_bash_blocks_in_order() {
        let response = "Let me look.\n```bash\nls -la\n```\nthen\n```bash\n\n```\n```python\nprint(1)\n```\n```bash\ncargo test\n```";
        assert_eq!(
            extract_command_blocks(response),
            vec![
                CommandBlock::Script("ls -la".to_string()),
                CommandBlock::Script("cargo test".to_string()),
            ]
        );
    }

    #[test]
    fn test_json_blocks_are_flagged() {
        let response = "```bash\n{\"features\": []}\n```\n```bash\n[ -f x ] && echo yes\n```";
        let blocks = extract_command_blocks(response);
        assert!(matches!(blocks[0], CommandBlock::Json(_)));
        assert_eq!(blocks[1], CommandBlock::Script("[ -f x ] && echo yes".to_string()));
    }

    #[test]
    fn test_block_count_is_capped() {
        let response = "```bash\necho hi\n```\n".repeat(MAX_COMMAND_BLOCKS + 5);
        assert_eq!(count_command_blocks(&response), MAX_COMMAND_BLOCKS + 5);
        assert_eq!(extract_command_blocks(&response).len(), MAX_COMMAND_BLOCKS);
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short"), "short");
        let long = "é".repeat(MAX_OUTPUT_CHARS + 10);
        let truncated = truncate_output(&long);
        assert!(truncated.starts_with(&"é".repeat(MAX_OUTPUT_CHARS)));
        assert!(truncated.contains(&format!("Total length: {} chars", MAX_OUTPUT_CHARS + 10)));
    }

    #[test]
    fn test_signal_must_stand_alone() {
        assert!(has_signal("done\n  TASK_COMPLETE  \n", TASK_COMPLETE));
        assert!(!has_signal("I will print TASK_COMPLETE when done", TASK_COMPLETE));
    }

    #[test]
    fn test_manager_decisions() {
        assert_eq!(parse_manager_decision("looks fine"), ManagerDecision::Continue);
        assert_eq!(parse_manager_decision("Review\nDECISION: COMPLETE\n"), ManagerDecision::Complete);
        assert_eq!(
            parse_manager_decision("DECISION: ABORT tests keep failing"),
            ManagerDecision::Abort("tests keep failing".to_string())
        );
        assert_eq!(
            parse_manager_decision("DECISION: ABORT"),
            ManagerDecision::Abort("no reason given".to_string())
        );
    }
}
