//! Prompt assembly: the project's PROMPT.md plus a rendered loop-context appendix.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::analyzer::STATUS_BLOCK_MARKERS;
use crate::core::plan::{TaskProgress, count_tasks, open_tasks};

const LOOP_CONTEXT_TEMPLATE: &str = include_str!("prompts/loop_context.md");

/// Open tasks listed inline; the rest are summarized.
const MAX_LISTED_TASKS: usize = 8;

/// Per-iteration facts rendered into the appendix.
#[derive(Debug, Clone, Default)]
pub struct LoopContext {
    pub loop_number: u32,
    pub calls_remaining: u32,
    pub max_calls: u32,
    pub session_resumed: bool,
    /// Raw fix plan markdown, when the file exists.
    pub fix_plan: Option<String>,
    pub fix_plan_file: String,
    pub previous_summary: Option<String>,
    pub circuit_warning: Option<String>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("loop_context", LOOP_CONTEXT_TEMPLATE)
            .expect("loop context template should be valid");
        Self { env }
    }

    fn render_loop_context(&self, ctx: &LoopContext) -> Result<String> {
        let tasks: Option<TaskProgress> = ctx
            .fix_plan
            .as_deref()
            .map(count_tasks)
            .filter(|t| t.total > 0);
        let open = ctx.fix_plan.as_deref().map(open_tasks).unwrap_or_default();
        let more_tasks = open.len().saturating_sub(MAX_LISTED_TASKS);
        let listed: Vec<String> = open.into_iter().take(MAX_LISTED_TASKS).collect();
        let (begin_marker, end_marker) = STATUS_BLOCK_MARKERS[0];

        let template = self.env.get_template("loop_context")?;
        let rendered = template.render(context! {
            loop_number => ctx.loop_number,
            calls_remaining => ctx.calls_remaining,
            max_calls => ctx.max_calls,
            session_resumed => ctx.session_resumed,
            tasks => tasks,
            open_tasks => listed,
            more_tasks => more_tasks,
            fix_plan_file => ctx.fix_plan_file.as_str(),
            previous_summary => ctx.previous_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            circuit_warning => ctx.circuit_warning.as_deref(),
            begin_marker => begin_marker,
            end_marker => end_marker,
        })?;
        Ok(rendered)
    }
}

/// Build the full prompt sent on stdin.
pub fn build_prompt(base_prompt: &str, ctx: &LoopContext) -> Result<String> {
    let engine = PromptEngine::new();
    let appendix = engine
        .render_loop_context(ctx)
        .context("render loop context")?;
    let mut prompt = base_prompt.trim_end().to_string();
    prompt.push_str(&appendix);
    prompt.push('\n');
    Ok(prompt)
}

/// Read a file that may not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}
