//! Deterministic rule-based generators used when model output is unusable.
//!
//! These never fail and never call the model. Given the same input they
//! produce the same records, apart from freshly generated chunk ids.

use std::collections::{BTreeSet, HashSet};

use designlens_shared::{
    Chunk, ChunkType, DEFAULT_CHUNK_SOURCE, DesignPrinciple, Inference, Insight, Pattern,
};

use crate::validate::new_chunk_id;

pub const EFFICIENCY_PATTERN: &str = "User Efficiency Needs";
pub const CLARITY_PATTERN: &str = "Information Clarity";
pub const GENERAL_PATTERN: &str = "General User Needs";

pub const SPEED_HEADLINE: &str = "USERS PRIORITIZE SPEED OVER FEATURES";
pub const COMPLEXITY_HEADLINE: &str = "COMPLEXITY CREATES COGNITIVE BARRIERS";
pub const CONTEXT_HEADLINE: &str = "USERS EXPECT TOOLS TO FIT THEIR CONTEXT";

fn mentions(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// One chunk per non-blank line.
pub fn chunks(research_data: &str) -> Vec<Chunk> {
    let mut taken = HashSet::new();
    research_data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.trim_start_matches(['-', '*', '•']).trim() {
            "" => line,
            stripped => stripped,
        })
        .map(|line| {
            let id = new_chunk_id(&taken);
            taken.insert(id.clone());
            Chunk {
                id,
                content: line.to_string(),
                source: DEFAULT_CHUNK_SOURCE.into(),
                chunk_type: if line.contains('"') {
                    ChunkType::Quote
                } else {
                    ChunkType::Observation
                },
                confidence: 0.85,
                tags: chunk_tags(line),
            }
        })
        .collect()
}

fn chunk_tags(line: &str) -> BTreeSet<String> {
    let lower = line.to_lowercase();
    let mut tags = BTreeSet::new();
    if lower.contains("user") {
        tags.insert("user_feedback".to_string());
    }
    if mentions(&lower, &["quick", "fast"]) {
        tags.insert("efficiency".to_string());
    }
    if mentions(&lower, &["cluttered", "complex", "confus"]) {
        tags.insert("complexity".to_string());
    }
    if lower.contains("simple") {
        tags.insert("simplicity".to_string());
    }
    if tags.is_empty() {
        tags.insert("general".to_string());
    }
    tags
}

// ---------------------------------------------------------------------------
// Inferring
// ---------------------------------------------------------------------------

/// One inference per chunk.
pub fn inferences(chunks: &[Chunk]) -> Vec<Inference> {
    chunks
        .iter()
        .map(|chunk| {
            let lower = chunk.content.to_lowercase();
            let mut meanings = Vec::new();
            if mentions(&lower, &["quick", "fast"]) {
                meanings.push("Users prioritize speed and efficiency".to_string());
            }
            if mentions(&lower, &["cluttered", "complex"]) {
                meanings.push("Users struggle with complexity".to_string());
            }
            if lower.contains("simple") {
                meanings.push("Users prefer simplicity".to_string());
            }
            if meanings.is_empty() {
                meanings.push("Users have specific needs and preferences".to_string());
            }
            Inference {
                chunk_id: chunk.id.clone(),
                meanings,
                importance: "Reveals user behavior patterns and needs".into(),
                context: "Indicates fundamental user preferences".into(),
                confidence: 0.88,
                reasoning: "Based on user feedback patterns".into(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Relating
// ---------------------------------------------------------------------------

/// Group inferences by the vocabulary of their meanings.
pub fn patterns(inferences: &[Inference]) -> Vec<Pattern> {
    if inferences.is_empty() {
        return Vec::new();
    }

    let matching = |needles: &[&str]| -> Vec<String> {
        inferences
            .iter()
            .filter(|i| {
                i.meanings
                    .iter()
                    .any(|m| mentions(&m.to_lowercase(), needles))
            })
            .map(|i| i.chunk_id.clone())
            .collect()
    };

    let mut patterns = Vec::new();

    let efficiency = matching(&["speed", "efficient", "quick", "fast"]);
    if !efficiency.is_empty() {
        patterns.push(pattern(
            EFFICIENCY_PATTERN,
            "Users consistently seek ways to complete tasks more efficiently",
            efficiency,
            &["efficiency", "speed", "productivity"],
            0.89,
        ));
    }

    let clarity = matching(&["complex", "cluttered", "simple", "clear"]);
    if !clarity.is_empty() {
        patterns.push(pattern(
            CLARITY_PATTERN,
            "Users struggle with unclear or complex information presentation",
            clarity,
            &["clarity", "simplicity", "communication"],
            0.87,
        ));
    }

    if patterns.is_empty() {
        patterns.push(pattern(
            GENERAL_PATTERN,
            "Users express needs that do not yet form a sharper theme",
            inferences.iter().map(|i| i.chunk_id.clone()).collect(),
            &["needs", "context"],
            0.6,
        ));
    }

    patterns
}

fn pattern(
    name: &str,
    description: &str,
    related: Vec<String>,
    themes: &[&str],
    strength: f64,
) -> Pattern {
    Pattern {
        name: name.into(),
        description: description.into(),
        evidence_count: u32::try_from(related.len()).unwrap_or(u32::MAX),
        related_inferences: related,
        themes: themes.iter().map(|t| (*t).to_string()).collect(),
        strength,
    }
}

// ---------------------------------------------------------------------------
// Explaining
// ---------------------------------------------------------------------------

/// One insight per recognised pattern name.
pub fn insights(patterns: &[Pattern]) -> Vec<Insight> {
    let mut seen = HashSet::new();
    patterns
        .iter()
        .filter_map(|pattern| {
            let name = pattern.name.to_lowercase();
            let insight = if name.contains("efficiency") {
                Insight {
                    headline: SPEED_HEADLINE.into(),
                    explanation: "Despite having access to advanced features, users consistently \
                                  choose the fastest path to completion."
                        .into(),
                    pattern_id: pattern.name.clone(),
                    non_consensus: true,
                    first_principles: true,
                    impact_score: 0.93,
                    supporting_evidence: strings(&[
                        "User feedback on speed preferences",
                        "Behavioral patterns in tool usage",
                    ]),
                }
            } else if name.contains("clarity") {
                Insight {
                    headline: COMPLEXITY_HEADLINE.into(),
                    explanation: "When information is presented in complex ways, users disengage \
                                  rather than invest effort to understand."
                        .into(),
                    pattern_id: pattern.name.clone(),
                    non_consensus: false,
                    first_principles: true,
                    impact_score: 0.91,
                    supporting_evidence: strings(&[
                        "User frustration with complex interfaces",
                        "Preference for simple tools",
                    ]),
                }
            } else if name.contains("general") {
                Insight {
                    headline: CONTEXT_HEADLINE.into(),
                    explanation: "Users judge a tool by how well it fits the task in front of \
                                  them, not by its feature list."
                        .into(),
                    pattern_id: pattern.name.clone(),
                    non_consensus: false,
                    first_principles: true,
                    impact_score: 0.7,
                    supporting_evidence: strings(&["Varied user needs across feedback"]),
                }
            } else {
                return None;
            };
            // Headlines stay unique when two patterns map to the same rule.
            seen.insert(insight.headline.clone()).then_some(insight)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Activating
// ---------------------------------------------------------------------------

/// One principle per recognised insight headline.
pub fn principles(insights: &[Insight]) -> Vec<DesignPrinciple> {
    insights
        .iter()
        .filter_map(|insight| {
            let (principle, verbs, direction, feasibility) =
                if insight.headline.contains("SPEED OVER FEATURES") {
                    (
                        "The system should prioritize speed and efficiency over feature complexity",
                        ["prioritize", "simplify", "streamline"],
                        "Focus on reducing steps and eliminating unnecessary complexity",
                        0.85,
                    )
                } else if insight.headline.contains("COGNITIVE BARRIERS") {
                    (
                        "The experience must present information with maximum clarity and minimal cognitive load",
                        ["clarify", "simplify", "reduce"],
                        "Use progressive disclosure and clear visual hierarchy",
                        0.82,
                    )
                } else if insight.headline.contains("CONTEXT") {
                    (
                        "The system should adapt to the context of each user's task",
                        ["adapt", "tailor", "enable"],
                        "Surface the right tools for the task at hand and hide the rest",
                        0.75,
                    )
                } else {
                    return None;
                };
            Some(DesignPrinciple {
                principle: principle.into(),
                insight_id: insight.headline.clone(),
                action_verbs: strings(&verbs),
                design_direction: direction.into(),
                priority: insight.impact_score,
                feasibility,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_LINES: &str =
        "Users want quick access to their data\nThe interface is too cluttered and complex";

    #[test]
    fn chunks_follow_line_rules() {
        let out = chunks("  - \"I love how fast it is\"\n\n* The layout is cluttered\n•plain line\n");
        assert_eq!(out.len(), 3);

        assert_eq!(out[0].content, "\"I love how fast it is\"");
        assert_eq!(out[0].chunk_type, ChunkType::Quote);
        assert!(out[0].tags.contains("efficiency"));

        assert_eq!(out[1].content, "The layout is cluttered");
        assert_eq!(out[1].chunk_type, ChunkType::Observation);
        assert_eq!(out[1].tags, BTreeSet::from(["complexity".to_string()]));

        assert_eq!(out[2].content, "plain line");
        assert_eq!(out[2].tags, BTreeSet::from(["general".to_string()]));
        assert!(out.iter().all(|c| c.confidence == 0.85 && c.source == DEFAULT_CHUNK_SOURCE));
    }

    #[test]
    fn blank_input_yields_no_chunks() {
        assert!(chunks("\n   \n\t\n").is_empty());
    }

    #[test]
    fn bullet_only_lines_are_kept() {
        let out = chunks("---\n- \n* real item");
        let contents: Vec<_> = out.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["---", "-", "real item"]);
    }

    #[test]
    fn mixed_line_gets_every_matching_meaning() {
        let i = inferences(&chunks("It is fast but the screen is cluttered"));
        assert_eq!(i.len(), 1);
        assert_eq!(
            i[0].meanings,
            vec!["Users prioritize speed and efficiency", "Users struggle with complexity"]
        );

        let p = patterns(&i);
        let names: Vec<_> = p.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![EFFICIENCY_PATTERN, CLARITY_PATTERN]);
        assert!(p.iter().all(|p| p.related_inferences == vec![i[0].chunk_id.clone()]));

        let plain = inferences(&chunks("Simple is better"));
        assert_eq!(plain[0].meanings, vec!["Users prefer simplicity"]);
    }

    #[test]
    fn fallback_is_deterministic_apart_from_ids() {
        let strip = |cs: Vec<Chunk>| -> Vec<Chunk> {
            cs.into_iter()
                .map(|mut c| {
                    c.id.clear();
                    c
                })
                .collect()
        };
        assert_eq!(strip(chunks(TWO_LINES)), strip(chunks(TWO_LINES)));

        let a = chunks(TWO_LINES);
        assert_eq!(
            serde_json::to_string(&principles(&insights(&patterns(&inferences(&a))))).unwrap(),
            serde_json::to_string(&principles(&insights(&patterns(&inferences(&a))))).unwrap()
        );
    }

    #[test]
    fn two_line_scenario_produces_full_chain() {
        let c = chunks(TWO_LINES);
        assert_eq!(c.len(), 2);

        let i = inferences(&c);
        assert_eq!(i[0].meanings, vec!["Users prioritize speed and efficiency"]);
        assert_eq!(i[1].meanings, vec!["Users struggle with complexity"]);
        assert_eq!(i[0].chunk_id, c[0].id);

        let p = patterns(&i);
        let names: Vec<_> = p.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![EFFICIENCY_PATTERN, CLARITY_PATTERN]);
        assert_eq!(p[0].related_inferences, vec![c[0].id.clone()]);
        assert_eq!(p[1].related_inferences, vec![c[1].id.clone()]);

        let ins = insights(&p);
        let headlines: Vec<_> = ins.iter().map(|i| i.headline.as_str()).collect();
        assert_eq!(headlines, vec![SPEED_HEADLINE, COMPLEXITY_HEADLINE]);
        assert_eq!(ins[0].pattern_id, EFFICIENCY_PATTERN);

        let pr = principles(&ins);
        assert_eq!(pr.len(), 2);
        assert_eq!(pr[0].insight_id, SPEED_HEADLINE);
        assert_eq!(pr[0].priority, 0.93);
        assert_eq!(pr[0].feasibility, 0.85);
        assert_eq!(pr[1].feasibility, 0.82);
    }

    #[test]
    fn interview_quotes_produce_full_chain() {
        let c = chunks("I just want to get this done quickly.\nThe interface is cluttered.");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].content, "I just want to get this done quickly.");

        let i = inferences(&c);
        assert_eq!(i[0].meanings, vec!["Users prioritize speed and efficiency"]);
        assert_eq!(i[1].meanings, vec!["Users struggle with complexity"]);

        let p = patterns(&i);
        let names: Vec<_> = p.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![EFFICIENCY_PATTERN, CLARITY_PATTERN]);

        let ins = insights(&p);
        let headlines: Vec<_> = ins.iter().map(|i| i.headline.as_str()).collect();
        assert_eq!(
            headlines,
            vec![
                "USERS PRIORITIZE SPEED OVER FEATURES",
                "COMPLEXITY CREATES COGNITIVE BARRIERS"
            ]
        );
        assert_eq!(principles(&ins).len(), 2);
    }

    #[test]
    fn unmatched_inferences_form_general_pattern() {
        let c = chunks("The onboarding email arrived late\nBilling happens monthly");
        let p = patterns(&inferences(&c));
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].name, GENERAL_PATTERN);
        assert_eq!(p[0].strength, 0.6);
        assert_eq!(p[0].evidence_count, 2);

        let ins = insights(&p);
        assert_eq!(ins[0].headline, CONTEXT_HEADLINE);
        assert_eq!(ins[0].impact_score, 0.7);
        let pr = principles(&ins);
        assert_eq!(pr[0].principle, "The system should adapt to the context of each user's task");
        assert_eq!(pr[0].feasibility, 0.75);
    }

    #[test]
    fn empty_predecessors_produce_empty_outputs() {
        assert!(inferences(&[]).is_empty());
        assert!(patterns(&[]).is_empty());
        assert!(insights(&[]).is_empty());
        assert!(principles(&[]).is_empty());
    }
}
