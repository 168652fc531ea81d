//! Post-parse checks that turn model records into a consistent stage output.
//!
//! Content problems are schema errors; dangling cross-references are
//! reference errors. Both are recoverable and route the stage to its
//! fallback. Scores are clamped rather than rejected.

use std::collections::HashSet;

use designlens_shared::{
    Chunk, DEFAULT_CHUNK_SOURCE, DesignLensError, DesignPrinciple, Inference, Insight, Pattern,
    Result, StepName,
};
use uuid::Uuid;

use crate::schema::clamp_score;

/// A fresh chunk id that is not already taken.
pub fn new_chunk_id(taken: &HashSet<String>) -> String {
    loop {
        let hex = Uuid::now_v7().simple().to_string();
        let id = format!("chunk_{}", &hex[hex.len() - 12..]);
        if !taken.contains(&id) {
            return id;
        }
    }
}

fn non_empty(records: usize, step: StepName) -> Result<()> {
    if records == 0 {
        return Err(DesignLensError::schema(step, "model returned no records"));
    }
    Ok(())
}

pub fn chunks(mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
    let step = StepName::Chunking;
    non_empty(chunks.len(), step)?;

    let mut ids = HashSet::with_capacity(chunks.len());
    for (idx, chunk) in chunks.iter_mut().enumerate() {
        chunk.content = chunk.content.trim().to_string();
        if chunk.content.is_empty() {
            return Err(DesignLensError::schema(step, format!("chunk {idx} has empty content")));
        }

        let id = chunk.id.trim();
        chunk.id = if id.is_empty() || ids.contains(id) {
            new_chunk_id(&ids)
        } else {
            id.to_string()
        };
        ids.insert(chunk.id.clone());

        if chunk.source.trim().is_empty() {
            chunk.source = DEFAULT_CHUNK_SOURCE.into();
        }
        chunk.confidence = clamp_score(chunk.confidence);
        chunk.tags = std::mem::take(&mut chunk.tags)
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    Ok(chunks)
}

pub fn inferences(mut inferences: Vec<Inference>, chunks: &[Chunk]) -> Result<Vec<Inference>> {
    let step = StepName::Inferring;
    non_empty(inferences.len(), step)?;

    let known: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    for inference in &mut inferences {
        inference.chunk_id = inference.chunk_id.trim().to_string();
        if !known.contains(inference.chunk_id.as_str()) {
            return Err(DesignLensError::reference(
                step,
                format!("inference refers to unknown chunk '{}'", inference.chunk_id),
            ));
        }
        inference.meanings.retain(|m| !m.trim().is_empty());
        if inference.meanings.is_empty() {
            return Err(DesignLensError::schema(
                step,
                format!("inference for '{}' has no meanings", inference.chunk_id),
            ));
        }
        inference.confidence = clamp_score(inference.confidence);
    }
    Ok(inferences)
}

pub fn patterns(mut patterns: Vec<Pattern>, inferences: &[Inference]) -> Result<Vec<Pattern>> {
    let step = StepName::Relating;
    non_empty(patterns.len(), step)?;

    let known: HashSet<&str> = inferences.iter().map(|i| i.chunk_id.as_str()).collect();
    let mut names = HashSet::with_capacity(patterns.len());
    for pattern in &mut patterns {
        pattern.name = pattern.name.trim().to_string();
        if pattern.name.is_empty() {
            return Err(DesignLensError::schema(step, "pattern has an empty name"));
        }
        if !names.insert(pattern.name.clone()) {
            return Err(DesignLensError::schema(
                step,
                format!("duplicate pattern name '{}'", pattern.name),
            ));
        }
        let mut seen = HashSet::new();
        pattern.related_inferences = std::mem::take(&mut pattern.related_inferences)
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if pattern.related_inferences.is_empty() {
            return Err(DesignLensError::schema(
                step,
                format!("pattern '{}' has no related inferences", pattern.name),
            ));
        }
        if let Some(missing) = pattern
            .related_inferences
            .iter()
            .find(|id| !known.contains(id.as_str()))
        {
            return Err(DesignLensError::reference(
                step,
                format!("pattern '{}' refers to unknown inference '{missing}'", pattern.name),
            ));
        }
        if pattern.evidence_count == 0 {
            pattern.evidence_count = u32::try_from(pattern.related_inferences.len()).unwrap_or(u32::MAX);
        }
        pattern.strength = clamp_score(pattern.strength);
    }
    Ok(patterns)
}

pub fn insights(mut insights: Vec<Insight>, patterns: &[Pattern]) -> Result<Vec<Insight>> {
    let step = StepName::Explaining;
    non_empty(insights.len(), step)?;

    let known: HashSet<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
    let mut headlines = HashSet::with_capacity(insights.len());
    for insight in &mut insights {
        insight.headline = insight.headline.trim().to_string();
        if insight.headline.is_empty() {
            return Err(DesignLensError::schema(step, "insight has an empty headline"));
        }
        if !headlines.insert(insight.headline.clone()) {
            return Err(DesignLensError::schema(
                step,
                format!("duplicate insight headline '{}'", insight.headline),
            ));
        }
        insight.pattern_id = insight.pattern_id.trim().to_string();
        if !known.contains(insight.pattern_id.as_str()) {
            return Err(DesignLensError::reference(
                step,
                format!("insight refers to unknown pattern '{}'", insight.pattern_id),
            ));
        }
        insight.impact_score = clamp_score(insight.impact_score);
    }
    Ok(insights)
}

pub fn principles(
    mut principles: Vec<DesignPrinciple>,
    insights: &[Insight],
) -> Result<Vec<DesignPrinciple>> {
    let step = StepName::Activating;
    non_empty(principles.len(), step)?;

    let known: HashSet<&str> = insights.iter().map(|i| i.headline.as_str()).collect();
    for principle in &mut principles {
        principle.principle = principle.principle.trim().to_string();
        if principle.principle.is_empty() {
            return Err(DesignLensError::schema(step, "design principle is empty"));
        }
        principle.insight_id = principle.insight_id.trim().to_string();
        if !known.contains(principle.insight_id.as_str()) {
            return Err(DesignLensError::reference(
                step,
                format!("principle refers to unknown insight '{}'", principle.insight_id),
            ));
        }
        principle.priority = clamp_score(principle.priority);
        principle.feasibility = clamp_score(principle.feasibility);
    }
    Ok(principles)
}
