//! Markdown methods section generated at freeze time
//!
//! The text is derived only from bundle content (never from the clock or the
//! environment at render time), so the same body always renders the same
//! `methods.md`.

use std::fmt::Write;

use crate::bundle::BundleBody;
use crate::pipeline::StepStatus;

/// Render the methods section for `body`
///
/// `body.methods_text` itself is ignored.
pub(crate) fn render(body: &BundleBody) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_methods(body, &mut out);
    out
}

fn write_methods(body: &BundleBody, out: &mut String) -> std::fmt::Result {
    writeln!(out, "## Methods")?;
    writeln!(out)?;
    if !body.description.is_empty() {
        writeln!(out, "{}", body.description)?;
        writeln!(out)?;
    }

    writeln!(out, "### Data")?;
    writeln!(out)?;
    if body.fingerprints.is_empty() {
        writeln!(out, "No datasets were fingerprinted.")?;
    }
    for (name, fp) in &body.fingerprints {
        let shape: Vec<String> = fp.shape.iter().map(|d| d.to_string()).collect();
        writeln!(
            out,
            "- `{}`: shape [{}], {} missing values, {} `{}`",
            name,
            shape.join(" x "),
            fp.null_pattern.total_nulls,
            fp.algorithm,
            fp.digest
        )?;
    }
    writeln!(out)?;

    writeln!(out, "### Randomness")?;
    writeln!(out)?;
    writeln!(out, "Master seed: {}.", body.seeds.master_seed)?;
    for (module, seed) in &body.seeds.derived {
        writeln!(out, "- `{}` seed {}", module, seed)?;
    }
    writeln!(out)?;

    writeln!(out, "### Analysis steps")?;
    writeln!(out)?;
    if body.steps.is_empty() {
        writeln!(out, "No steps were recorded.")?;
    }
    for step in &body.steps {
        let status = match &step.status {
            StepStatus::Open => "not finished".to_string(),
            StepStatus::Completed => "completed".to_string(),
            StepStatus::Failed { error } => format!("failed: {}", error),
        };
        writeln!(
            out,
            "{}. `{}` ({}), {}",
            step.sequence, step.name, step.module, status
        )?;
    }

    if !body.decisions.is_empty() {
        writeln!(out)?;
        writeln!(out, "### Decisions")?;
        writeln!(out)?;
        for decision in &body.decisions {
            match decision.related_step_sequence {
                Some(step) => writeln!(
                    out,
                    "- [{}] {} (step {})",
                    decision.sequence, decision.rationale, step
                )?,
                None => writeln!(out, "- [{}] {}", decision.sequence, decision.rationale)?,
            }
        }
    }

    if !body.capture_errors.is_empty() {
        writeln!(out)?;
        writeln!(out, "### Incomplete state capture")?;
        writeln!(out)?;
        for failure in &body.capture_errors {
            writeln!(out, "- `{}`: {}", failure.module, failure.error)?;
        }
    }

    writeln!(out)?;
    writeln!(out, "### Environment")?;
    writeln!(out)?;
    writeln!(out, "{}.", body.environment.describe())?;
    for (library, version) in &body.environment.libraries {
        writeln!(out, "- {} {}", library, version)?;
    }
    Ok(())
}
