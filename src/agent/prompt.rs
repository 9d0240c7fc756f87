use crate::agent::session::Goal;
use crate::model::RetrievedContext;

const EMPTY_CONTEXT: &str =
    "(no code in the repository graph matched this request; work from the request text)";

fn instructions(goal: Goal) -> &'static str {
    match goal {
        Goal::Question => {
            "Answer the question about this repository. Refer to code as path:line. \
             Do not propose a patch."
        }
        Goal::Issue => {
            "Resolve the issue. Reply with a single unified diff in a ```diff fenced block. \
             Paths are relative to the repository root, prefixed a/ and b/. Hunk headers \
             must count their lines exactly. If previous attempts failed, fix what the \
             history reports."
        }
        Goal::Review => {
            "Review the pull request diff in the request. List concrete problems, one per \
             line, each with path:line. Say so plainly if you find none."
        }
    }
}

/// Prompt for one Generating step. History is included verbatim (already
/// capped by the caller) so each attempt sees why earlier ones failed.
pub fn render_prompt(goal: Goal, request: &str, context: &RetrievedContext, history: &str) -> String {
    let mut out = String::new();
    out.push_str("## Task\n");
    out.push_str(instructions(goal));
    out.push_str("\n\n## Request\n");
    out.push_str(request.trim_end());
    out.push_str("\n\n## Repository context\n");
    if context.is_empty() {
        out.push_str(EMPTY_CONTEXT);
    } else {
        out.push_str(&context.render());
        if context.truncated {
            out.push_str("\n\n(context truncated to fit the token budget)");
        }
    }
    if !history.is_empty() {
        out.push_str("\n\n## Previous attempts\n");
        out.push_str(history);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_is_stated() {
        let context = RetrievedContext::empty("q", "proximity-v1", 100);
        let prompt = render_prompt(Goal::Issue, "Crash on start", &context, "");
        assert!(prompt.contains("## Request\nCrash on start"));
        assert!(prompt.contains(EMPTY_CONTEXT));
        assert!(!prompt.contains("## Previous attempts"));
        assert!(prompt.contains("```diff"));
    }

    #[test]
    fn history_is_appended_last() {
        let context = RetrievedContext::empty("q", "proximity-v1", 100);
        let prompt = render_prompt(Goal::Question, "Why?", &context, "#1 test [failed]\nboom");
        assert!(prompt.ends_with("## Previous attempts\n#1 test [failed]\nboom\n"));
    }
}
