//! Prompt text for each pipeline stage.
//!
//! System prompts describe the task; user prompts embed the predecessor
//! records with the identifiers the model must reference.

use designlens_shared::{Chunk, Inference, Insight, Pattern, StepName};

/// System prompt for a stage, without format instructions.
pub fn system_prompt(step: StepName) -> &'static str {
    match step {
        StepName::Chunking => {
            "You break qualitative research material into chunks: small, self-contained \
pieces of evidence.

Each chunk must:
- hold exactly one idea
- make sense when read on its own
- be about as large as the other chunks
- stop splitting once further splitting would lose meaning

Classify each chunk as one of: quote (words a participant said), observation \
(something a researcher saw), fact (from secondary sources), behavior (a recurring \
action), or pain_point (a need or frustration). Add short lowercase tags naming \
what the chunk is about."
        }
        StepName::Inferring => {
            "You interpret research chunks.

For every chunk answer three questions:
1. What does this mean?
2. Why does it matter?
3. What does it tell us about the problem or its context?

A chunk may carry several meanings and meanings may overlap. Write them in your \
own words. Set chunk_id to the id of the chunk you are interpreting."
        }
        StepName::Relating => {
            "You find patterns across research inferences.

Group inferences that point in the same direction, repeat each other, or share a \
theme. A pattern names a relationship in the data, not a bare category, so give it \
a clear, specific name. List the chunk ids of the grouped inferences in \
related_inferences and rate how strongly the evidence supports the pattern."
        }
        StepName::Explaining => {
            "You explain research patterns.

For every pattern keep asking why: why is this happening, why does it matter, what \
underlying truth does it reveal? Prefer insights that challenge common assumptions \
(non_consensus) and that rest on fundamental truths (first_principles).

Write each insight as a short, bold headline followed by an explanation. Set \
pattern_id to the exact name of the pattern it explains."
        }
        StepName::Activating => {
            "You turn research insights into design principles.

For every insight write one actionable principle that tells design how to respond. \
It is a starting point for ideation, not a finished solution. Open with a phrase \
such as \"The system should...\" or \"The experience must...\", use concrete action \
verbs (provide, reduce, enable, avoid, simplify, clarify), and make the reader ask \
\"how might we do that?\". Set insight_id to the exact headline of the insight."
        }
    }
}

pub fn chunking_prompt(research_data: &str) -> String {
    format!("Chunk the following research data:\n\n{research_data}")
}

pub fn inferring_prompt(chunks: &[Chunk]) -> String {
    let body = chunks
        .iter()
        .map(|c| format!("Chunk {}: {}", c.id, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Interpret the following chunks:\n\n{body}")
}

pub fn relating_prompt(inferences: &[Inference]) -> String {
    let body = inferences
        .iter()
        .map(|i| format!("Inference {}: {}", i.chunk_id, i.meanings.join(", ")))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Identify patterns in the following inferences:\n\n{body}")
}

pub fn explaining_prompt(patterns: &[Pattern]) -> String {
    let body = patterns
        .iter()
        .map(|p| {
            let themes: Vec<&str> = p.themes.iter().map(String::as_str).collect();
            format!(
                "Pattern: {}\nDescription: {}\nThemes: {}",
                p.name,
                p.description,
                themes.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Generate insights from the following patterns:\n\n{body}")
}

pub fn activating_prompt(insights: &[Insight]) -> String {
    let body = insights
        .iter()
        .map(|i| format!("Insight: {}\nExplanation: {}", i.headline, i.explanation))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Create design principles from the following insights:\n\n{body}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use designlens_shared::ChunkType;

    use super::*;

    #[test]
    fn every_stage_has_a_system_prompt() {
        for step in StepName::ALL {
            assert!(!system_prompt(step).is_empty());
        }
        assert!(system_prompt(StepName::Explaining).contains("pattern_id"));
        assert!(system_prompt(StepName::Activating).contains("insight_id"));
    }

    #[test]
    fn inferring_prompt_embeds_chunk_ids() {
        let chunks = vec![Chunk {
            id: "chunk_a1".into(),
            content: "I just want to get this done quickly.".into(),
            source: "research_data".into(),
            chunk_type: ChunkType::Quote,
            confidence: 0.9,
            tags: BTreeSet::new(),
        }];
        let prompt = inferring_prompt(&chunks);
        assert!(prompt.contains("Chunk chunk_a1: I just want to get this done quickly."));
    }

    #[test]
    fn explaining_prompt_lists_themes() {
        let patterns = vec![Pattern {
            name: "Information Clarity".into(),
            description: "Users struggle".into(),
            related_inferences: vec!["c1".into()],
            themes: BTreeSet::from(["clarity".to_string(), "simplicity".to_string()]),
            strength: 0.8,
            evidence_count: 1,
        }];
        let prompt = explaining_prompt(&patterns);
        assert!(prompt.contains("Pattern: Information Clarity"));
        assert!(prompt.contains("Themes: clarity, simplicity"));
    }
}
