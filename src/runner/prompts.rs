// ABOUTME: Prompt text for the coding turns, the periodic manager review and the QA pass

use super::response::{QA_FAILED, QA_PASSED, TASK_COMPLETE};

const COMMAND_PROTOCOL: &str = "Run shell commands by putting them in ```bash fenced blocks. \
Each block runs in the workspace root inside the container and its output is shown to you on the next turn.";

pub fn coding_prompt(goal: &str, iteration: u32, max_iterations: u32, feedback: &str) -> String {
    let mut prompt = format!(
        "You are an autonomous coding agent working in /workspace.\n\n\
         ## Goal\n{goal}\n\n\
         ## Iteration\n{iteration} of {max_iterations}\n\n\
         {COMMAND_PROTOCOL}\n\n\
         When the goal is fully implemented and verified, print {TASK_COMPLETE} on a line by itself.\n"
    );
    if !feedback.trim().is_empty() {
        prompt.push_str("\n## Results from the previous turn\n");
        prompt.push_str(feedback);
        prompt.push('\n');
    }
    prompt
}

pub fn manager_prompt(goal: &str, iteration: u32, max_iterations: u32, recent: &str) -> String {
    format!(
        "You are the engineering manager reviewing an autonomous coding agent.\n\n\
         ## Goal\n{goal}\n\n\
         ## Progress\nIteration {iteration} of {max_iterations}.\n\n\
         ## Most recent agent activity\n{recent}\n\n\
         You may inspect the workspace. {COMMAND_PROTOCOL}\n\n\
         End your review with exactly one line:\n\
         DECISION: CONTINUE <guidance for the agent>\n\
         DECISION: COMPLETE\n\
         DECISION: ABORT <reason>\n"
    )
}

pub fn qa_prompt(goal: &str) -> String {
    format!(
        "You are the QA reviewer for work done in /workspace.\n\n\
         ## Goal that was implemented\n{goal}\n\n\
         Verify the implementation: build it, run its tests and check the goal is met. {COMMAND_PROTOCOL}\n\n\
         Print {QA_PASSED} on a line by itself if everything checks out, otherwise print {QA_FAILED} \
         followed by what is wrong.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coding_prompt_includes_feedback_only_when_present() {
        let first = coding_prompt("Add a CLI flag", 1, 10, "");
        assert!(first.contains("Add a CLI flag"));
        assert!(!first.contains("previous turn"));

        let next = coding_prompt("Add a CLI flag", 2, 10, "Command Output:\nok");
        assert!(next.contains("previous turn"));
        assert!(next.contains("Command Output:\nok"));
    }

    #[test]
    fn test_manager_prompt_lists_decisions() {
        let prompt = manager_prompt("goal", 5, 20, "recent");
        assert!(prompt.contains("DECISION: COMPLETE"));
        assert!(prompt.contains("Iteration 5 of 20"));
    }
}
