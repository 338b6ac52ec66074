use std::collections::HashMap;

use tera::Context;

use super::engine::render_or_raw;
use crate::engine::types::{Job, ResultItem, StepDef};

/// Render a step's prompt templates against the job context.
///
/// The template context exposes `job`, `step`, `sources`, `options`, and
/// `previous` (step id → items produced by that step). Typical idioms:
///
/// ```text
/// {% for s in sources %}{{ s.content }}
/// {% endfor %}
/// {{ previous["summarize"].0.data.text }}
/// ```
///
/// The final prompt is `trim(system + "\n" + user)`.
pub fn build_prompt(
    step: &StepDef,
    job: &Job,
    outputs: &HashMap<String, Vec<ResultItem>>,
) -> String {
    let Some(template) = &step.prompt else {
        return String::new();
    };

    let mut ctx = Context::new();
    ctx.insert("job", job);
    ctx.insert("step", step);
    ctx.insert("sources", &job.input.sources);
    ctx.insert("options", &job.input.options);
    ctx.insert("previous", outputs);

    let mut prompt = String::new();
    if !template.system.is_empty() {
        prompt.push_str(&render_or_raw(&template.system, &ctx));
        prompt.push('\n');
    }
    if !template.user.is_empty() {
        prompt.push_str(&render_or_raw(&template.user, &ctx));
    }
    prompt.trim().to_string()
}
