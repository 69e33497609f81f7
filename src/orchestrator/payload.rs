//! Instruction payload handed to the worker for one attempt.

use crate::evidence::EvidenceContract;

/// Inputs for one attempt's payload.
#[derive(Debug, Clone, Default)]
pub struct PayloadInput<'a> {
    pub project: &'a str,
    pub milestone: &'a str,
    pub milestone_description: &'a str,
    pub phase: &'a str,
    pub attempt: u32,
    pub instruction: &'a str,
    /// Corrective constraints issued by the learner or a step-back
    pub constraints: &'a [String],
    /// Diagnostic from the previous failed attempt
    pub previous_diagnostic: Option<&'a str>,
    pub contract: Option<&'a EvidenceContract>,
}

/// Render the payload. Identical inputs produce identical text.
pub fn build_payload(input: &PayloadInput<'_>) -> String {
    let mut out = format!(
        "You are working on project '{}', milestone '{}'.\n",
        input.project, input.milestone
    );
    if !input.milestone_description.trim().is_empty() {
        out.push_str(&format!("\n## MILESTONE\n{}\n", input.milestone_description.trim()));
    }

    out.push_str(&format!(
        "\n## TASK\nPhase '{}' (attempt {})\n\n{}\n",
        input.phase,
        input.attempt,
        input.instruction.trim()
    ));

    if !input.constraints.is_empty() {
        out.push_str("\n## CONSTRAINTS\n");
        for (i, constraint) in input.constraints.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, constraint));
        }
    }

    if let Some(diagnostic) = input.previous_diagnostic {
        out.push_str(&format!(
            "\n## PREVIOUS ATTEMPT\nThe previous attempt did not complete this phase:\n{}\n",
            diagnostic
        ));
    }

    out.push_str("\n## COMPLETION\n");
    match input.contract {
        Some(contract) if !contract.predicates.is_empty() => {
            out.push_str("This phase is verified independently. It is complete only when:\n");
            for predicate in &contract.predicates {
                out.push_str(&format!("- {}\n", predicate.describe()));
            }
        }
        _ => out.push_str("Finish the task fully before reporting success.\n"),
    }
    out
}
