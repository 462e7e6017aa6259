use crate::database::TranscriptSegment;
use crate::pipeline::stage::{SpeakerTurn, TimedText};

pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";

/// Minimum duration a consolidated span must reach to be kept.
const MIN_CONSOLIDATED_SECS: f64 = 1.0;

/// Assign a speaker label to every transcription segment by maximal temporal
/// overlap against the diarized turns.
///
/// Rules, in order:
/// - the label with the greatest accumulated overlap wins;
/// - an overlap tie goes to the label whose overlapping turn is longer;
/// - a segment with no overlap at all takes the label of the nearest
///   preceding turn, or UNKNOWN when nothing precedes it.
pub fn merge_transcript(
    transcription: &[TimedText],
    turns: &[SpeakerTurn],
) -> Vec<TranscriptSegment> {
    let mut merged = Vec::with_capacity(transcription.len());

    for seg in transcription {
        let text = seg.text.trim();
        if text.is_empty() || seg.start >= seg.end {
            continue;
        }

        let speaker = assign_speaker(seg, turns);
        merged.push(TranscriptSegment {
            start: seg.start,
            end: seg.end,
            text: text.to_string(),
            speaker,
            source: "merge".to_string(),
        });
    }

    merged
}

fn assign_speaker(seg: &TimedText, turns: &[SpeakerTurn]) -> String {
    let seg_range = crate::pipeline::stage::TimeRange {
        start: seg.start,
        end: seg.end,
    };

    // Accumulate overlap per label, remembering the longest contributing turn
    // for the tie-break.
    let mut per_label: std::collections::HashMap<&str, (f64, f64)> =
        std::collections::HashMap::new();
    for turn in turns {
        let overlap = seg_range.overlap(&turn.range());
        if overlap > 0.0 {
            let entry = per_label.entry(turn.label.as_str()).or_insert((0.0, 0.0));
            entry.0 += overlap;
            entry.1 = entry.1.max(turn.range().duration());
        }
    }

    if let Some((label, _)) = per_label.iter().max_by(|a, b| {
        (a.1 .0, a.1 .1)
            .partial_cmp(&(b.1 .0, b.1 .1))
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        return (*label).to_string();
    }

    // No overlap: nearest preceding turn wins.
    turns
        .iter()
        .filter(|t| t.end <= seg.start)
        .max_by(|a, b| a.end.partial_cmp(&b.end).unwrap_or(std::cmp::Ordering::Equal))
        .map(|t| t.label.clone())
        .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string())
}

/// Coalesce consecutive same-speaker segments separated by a negligible gap,
/// then drop consolidated spans too short to be meaningful.
pub fn consolidate(segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    let mut consolidated: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());

    for seg in segments {
        match consolidated.last_mut() {
            Some(prev) if prev.speaker == seg.speaker && (seg.start - prev.end).abs() < 0.01 => {
                prev.end = seg.end;
                prev.text.push(' ');
                prev.text.push_str(&seg.text);
            }
            _ => consolidated.push(seg),
        }
    }

    consolidated
        .into_iter()
        .filter(|s| {
            let keep = s.end - s.start >= MIN_CONSOLIDATED_SECS;
            if !keep {
                log::debug!(
                    "Dropping short consolidated span [{:.2}s - {:.2}s] {}",
                    s.start,
                    s.end,
                    s.speaker
                );
            }
            keep
        })
        .collect()
}

/// Fallback when diarization is unavailable: every line is UNKNOWN.
pub fn transcript_without_speakers(transcription: &[TimedText]) -> Vec<TranscriptSegment> {
    transcription
        .iter()
        .filter(|seg| !seg.text.trim().is_empty() && seg.start < seg.end)
        .map(|seg| TranscriptSegment {
            start: seg.start,
            end: seg.end,
            text: seg.text.trim().to_string(),
            speaker: UNKNOWN_SPEAKER.to_string(),
            source: "transcribe".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tt(start: f64, end: f64, text: &str) -> TimedText {
        TimedText {
            start,
            end,
            text: text.to_string(),
        }
    }

    fn turn(start: f64, end: f64, label: &str) -> SpeakerTurn {
        SpeakerTurn {
            start,
            end,
            label: label.to_string(),
        }
    }

    #[test]
    fn test_maximal_overlap_wins() {
        let transcription = vec![tt(0.0, 10.0, "hello there")];
        let turns = vec![turn(0.0, 3.0, "SPEAKER_00"), turn(3.0, 10.0, "SPEAKER_01")];
        let merged = merge_transcript(&transcription, &turns);
        assert_eq!(merged[0].speaker, "SPEAKER_01");
    }

    #[test]
    fn test_overlap_tie_broken_by_longer_turn() {
        // Both labels overlap the segment for exactly 2s, but SPEAKER_01's
        // turn is longer overall.
        let transcription = vec![tt(4.0, 8.0, "tied")];
        let turns = vec![
            turn(4.0, 6.0, "SPEAKER_00"),
            turn(6.0, 20.0, "SPEAKER_01"),
        ];
        let merged = merge_transcript(&transcription, &turns);
        assert_eq!(merged[0].speaker, "SPEAKER_01");
    }

    #[test]
    fn test_no_overlap_takes_nearest_preceding() {
        let transcription = vec![tt(20.0, 22.0, "afterthought")];
        let turns = vec![turn(0.0, 5.0, "SPEAKER_00"), turn(6.0, 10.0, "SPEAKER_01")];
        let merged = merge_transcript(&transcription, &turns);
        assert_eq!(merged[0].speaker, "SPEAKER_01");
    }

    #[test]
    fn test_no_preceding_turn_is_unknown() {
        let transcription = vec![tt(0.0, 1.0, "cold open")];
        let turns = vec![turn(5.0, 10.0, "SPEAKER_00")];
        let merged = merge_transcript(&transcription, &turns);
        assert_eq!(merged[0].speaker, UNKNOWN_SPEAKER);
    }

    #[test]
    fn test_empty_text_and_inverted_ranges_dropped() {
        let transcription = vec![tt(0.0, 1.0, "   "), tt(5.0, 4.0, "backwards")];
        let merged = merge_transcript(&transcription, &[turn(0.0, 10.0, "SPEAKER_00")]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_consolidate_merges_consecutive_same_speaker() {
        let segments = vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.0,
                text: "first".into(),
                speaker: "SPEAKER_00".into(),
                source: "merge".into(),
            },
            TranscriptSegment {
                start: 2.0,
                end: 4.0,
                text: "second".into(),
                speaker: "SPEAKER_00".into(),
                source: "merge".into(),
            },
            TranscriptSegment {
                start: 4.0,
                end: 6.0,
                text: "other".into(),
                speaker: "SPEAKER_01".into(),
                source: "merge".into(),
            },
        ];
        let result = consolidate(segments);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].text, "first second");
        assert_eq!(result[0].end, 4.0);
    }

    #[test]
    fn test_consolidate_drops_sub_second_spans() {
        let segments = vec![TranscriptSegment {
            start: 0.0,
            end: 0.4,
            text: "uh".into(),
            speaker: "SPEAKER_00".into(),
            source: "merge".into(),
        }];
        assert!(consolidate(segments).is_empty());
    }
}
