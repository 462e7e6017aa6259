pub mod registry;

pub use registry::SpeakerRegistry;

use crate::database::GlobalSpeaker;
use crate::pipeline::stage::{SpeakerTurn, TimeRange};

/// Cosine similarity between two embeddings. Mismatched or empty vectors
/// score 0.0 rather than erroring; the Embedder contract owns dimensionality.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Average per-turn embeddings into one candidate voiceprint.
pub fn average_embeddings(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let dim = first.len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return None;
    }
    let count = embeddings.len() as f32;
    let mut avg = vec![0.0f32; dim];
    for embedding in embeddings {
        for (acc, value) in avg.iter_mut().zip(embedding) {
            *acc += value / count;
        }
    }
    Some(avg)
}

/// Pick the embedding source set for one label: the top-K longest turns,
/// excluding any shorter than the minimum duration. Short turns produce
/// unreliable embeddings.
pub fn select_representative_turns(
    turns: &[SpeakerTurn],
    label: &str,
    top_k: usize,
    min_secs: f64,
) -> Vec<TimeRange> {
    let mut candidates: Vec<TimeRange> = turns
        .iter()
        .filter(|t| t.label == label && t.range().duration() >= min_secs)
        .map(|t| t.range())
        .collect();
    candidates.sort_by(|a, b| {
        b.duration()
            .partial_cmp(&a.duration())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top_k);
    candidates
}

/// Result of scoring a candidate voiceprint against a user's registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub best: Option<(i64, f32)>,
    pub second_best_score: Option<f32>,
    pub accepted: bool,
}

/// Score the candidate against every voiceprint of every global speaker and
/// apply the acceptance rules.
///
/// A match is accepted only when the best score clears the absolute threshold
/// AND beats the runner-up by at least the margin. The margin rule exists to
/// reject ambiguous matches between two similar-sounding speakers. With a
/// single candidate there is no runner-up and the threshold alone decides.
pub fn evaluate_match(
    candidate: &[f32],
    registry: &[(GlobalSpeaker, Vec<Vec<f32>>)],
    threshold: f32,
    margin: f32,
) -> MatchOutcome {
    // Per-speaker score is the best of that speaker's stored voiceprints.
    let mut scored: Vec<(i64, f32)> = registry
        .iter()
        .filter_map(|(speaker, vectors)| {
            vectors
                .iter()
                .map(|v| cosine_similarity(candidate, v))
                .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |a| a.max(s))))
                .map(|score| (speaker.id, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let best = scored.first().copied();
    let second_best_score = scored.get(1).map(|(_, s)| *s);

    let accepted = match (best, second_best_score) {
        (Some((_, best_score)), Some(second)) => {
            best_score > threshold && best_score - second > margin
        }
        (Some((_, best_score)), None) => best_score > threshold,
        (None, _) => false,
    };

    MatchOutcome {
        best,
        second_best_score,
        accepted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaker(id: i64, name: &str) -> GlobalSpeaker {
        GlobalSpeaker {
            id,
            user_id: "u1".into(),
            name: name.into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        // Same vector should have similarity 1.0
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);

        // Orthogonal vectors should have similarity 0.0
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);

        // Opposite vectors should have similarity -1.0
        let c = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &c) + 1.0).abs() < 0.001);

        // Mismatched lengths score zero
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_average_embeddings() {
        let avg = average_embeddings(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert!((avg[0] - 0.5).abs() < 1e-6);
        assert!((avg[1] - 0.5).abs() < 1e-6);
        assert!(average_embeddings(&[]).is_none());
        assert!(average_embeddings(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }

    #[test]
    fn test_representative_turns_excludes_short_and_caps_k() {
        let turns: Vec<SpeakerTurn> = (0..15)
            .map(|i| SpeakerTurn {
                start: i as f64 * 10.0,
                end: i as f64 * 10.0 + 1.0 + i as f64 * 0.1,
                label: "SPEAKER_00".into(),
            })
            .chain(std::iter::once(SpeakerTurn {
                start: 500.0,
                end: 500.3, // below the 0.5s floor
                label: "SPEAKER_00".into(),
            }))
            .chain(std::iter::once(SpeakerTurn {
                start: 600.0,
                end: 700.0,
                label: "SPEAKER_01".into(),
            }))
            .collect();

        let selected = select_representative_turns(&turns, "SPEAKER_00", 10, 0.5);
        assert_eq!(selected.len(), 10);
        // Longest first
        assert!(selected[0].duration() >= selected[9].duration());
        assert!(selected.iter().all(|r| r.duration() >= 0.5));
    }

    #[test]
    fn test_match_requires_threshold() {
        let registry = vec![(speaker(1, "Alice"), vec![vec![0.0, 1.0]])];
        let outcome = evaluate_match(&[1.0, 0.0], &registry, 0.75, 0.05);
        assert!(!outcome.accepted);
    }

    #[test]
    fn test_match_requires_margin() {
        // Two speakers scoring 0.80 and 0.78: both clear the threshold but
        // the margin is violated, so neither is accepted.
        let candidate = vec![1.0, 0.0];
        let a = vec![0.80, (1.0f32 - 0.80 * 0.80).sqrt()];
        let b = vec![0.78, (1.0f32 - 0.78 * 0.78).sqrt()];
        let registry = vec![
            (speaker(1, "Alice"), vec![a]),
            (speaker(2, "Bob"), vec![b]),
        ];

        let outcome = evaluate_match(&candidate, &registry, 0.75, 0.05);
        let (best_id, best_score) = outcome.best.unwrap();
        assert_eq!(best_id, 1);
        assert!(best_score > 0.75);
        assert!(outcome.second_best_score.unwrap() > 0.75);
        assert!(!outcome.accepted);
    }

    #[test]
    fn test_clear_winner_accepted() {
        let candidate = vec![1.0, 0.0];
        let registry = vec![
            (speaker(1, "Alice"), vec![vec![0.99, 0.14]]),
            (speaker(2, "Bob"), vec![vec![0.2, 0.98]]),
        ];
        let outcome = evaluate_match(&candidate, &registry, 0.75, 0.05);
        assert!(outcome.accepted);
        assert_eq!(outcome.best.unwrap().0, 1);
    }

    #[test]
    fn test_single_candidate_uses_threshold_only() {
        let candidate = vec![1.0, 0.0];
        let registry = vec![(speaker(1, "Alice"), vec![vec![0.99, 0.14]])];
        let outcome = evaluate_match(&candidate, &registry, 0.75, 0.05);
        assert!(outcome.accepted);
        assert!(outcome.second_best_score.is_none());
    }

    #[test]
    fn test_per_speaker_score_is_best_voiceprint() {
        // Alice has one poor and one excellent voiceprint; the excellent one
        // should carry her score.
        let candidate = vec![1.0, 0.0];
        let registry = vec![(
            speaker(1, "Alice"),
            vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        )];
        let outcome = evaluate_match(&candidate, &registry, 0.75, 0.05);
        assert!(outcome.accepted);
        assert!((outcome.best.unwrap().1 - 1.0).abs() < 1e-6);
    }
}
