//! Checklist counting for the externally tracked fix plan.

use serde::Serialize;

/// Tally of markdown checklist items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TaskProgress {
    pub total: u32,
    pub completed: u32,
}

impl TaskProgress {
    pub fn remaining(self) -> u32 {
        self.total.saturating_sub(self.completed)
    }

    /// True only when there is at least one task and all are checked.
    pub fn all_complete(self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Count `- [ ]` / `- [x]` items (also `*` and `+` bullets, any indentation).
pub fn count_tasks(markdown: &str) -> TaskProgress {
    let mut progress = TaskProgress::default();
    for line in markdown.lines() {
        match checkbox(line) {
            Some(true) => {
                progress.total += 1;
                progress.completed += 1;
            }
            Some(false) => progress.total += 1,
            None => {}
        }
    }
    progress
}

/// Unchecked items, trimmed, in document order.
pub fn open_tasks(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter(|line| checkbox(line) == Some(false))
        .map(|line| line.trim().to_string())
        .collect()
}

fn checkbox(line: &str) -> Option<bool> {
    let rest = line.trim_start();
    let rest = rest
        .strip_prefix("- ")
        .or_else(|| rest.strip_prefix("* "))
        .or_else(|| rest.strip_prefix("+ "))?;
    let rest = rest.trim_start();
    if rest.starts_with("[ ]") {
        Some(false)
    } else if rest.starts_with("[x]") || rest.starts_with("[X]") {
        Some(true)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Fix plan\n\n## High\n- [x] parse config\n- [ ] wire executor\n  * [X] nested done\n+ [ ] docs\n- not a task\n[ ] no bullet\n";

    #[test]
    fn counts_checked_and_unchecked() {
        let progress = count_tasks(PLAN);
        assert_eq!(
            progress,
            TaskProgress {
                total: 4,
                completed: 2
            }
        );
        assert_eq!(progress.remaining(), 2);
        assert!(!progress.all_complete());
    }

    #[test]
    fn empty_plan_is_not_complete() {
        assert!(!count_tasks("# nothing yet\n").all_complete());
    }

    #[test]
    fn all_checked_is_complete() {
        assert!(count_tasks("- [x] a\n- [X] b\n").all_complete());
    }

    #[test]
    fn open_tasks_lists_unchecked() {
        assert_eq!(open_tasks(PLAN), vec!["- [ ] wire executor", "+ [ ] docs"]);
    }
}
