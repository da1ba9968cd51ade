//! Pipeline stdout protocol.
//!
//! The detection pipeline prints human-readable status lines such as
//! `Frame count: 120` or `Unique varroa: 3`. Each recognised marker is followed
//! by a count; a line may carry several markers and every one of them is tried.

use serde::Serialize;
use tracing::warn;

use crate::error::ParseSkip;

pub const FRAME_COUNT: &str = "Frame count:";
pub const CURRENT_BEES: &str = "Current frame bees:";
pub const CURRENT_VARROA: &str = "Current frame varroa:";
pub const UNIQUE_BEES: &str = "Unique bees:";
pub const UNIQUE_VARROA: &str = "Unique varroa:";

/// A typed metric extracted from one marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParsedEvent {
    UniqueBees(u64),
    UniqueVarroa(u64),
    CurrentBees(u64),
    CurrentVarroa(u64),
    FrameCount(u64),
}

type Constructor = fn(u64) -> ParsedEvent;

/// Markers in the order they are applied within one line.
const MARKERS: [(&str, Constructor); 5] = [
    (UNIQUE_BEES, ParsedEvent::UniqueBees),
    (UNIQUE_VARROA, ParsedEvent::UniqueVarroa),
    (CURRENT_BEES, ParsedEvent::CurrentBees),
    (CURRENT_VARROA, ParsedEvent::CurrentVarroa),
    (FRAME_COUNT, ParsedEvent::FrameCount),
];

/// Events and skipped markers found on one line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    pub events: Vec<ParsedEvent>,
    pub skipped: Vec<ParseSkip>,
}

/// Parses one line, logging markers whose value is unreadable.
pub fn parse(line: &str) -> Vec<ParsedEvent> {
    let outcome = parse_line(line);
    for skip in &outcome.skipped {
        warn!("{}", skip);
    }
    outcome.events
}

/// Parses one line without logging.
pub fn parse_line(line: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    for (marker, event) in MARKERS {
        match extract(line, marker) {
            Some(Ok(n)) => outcome.events.push(event(n)),
            Some(Err(skip)) => outcome.skipped.push(skip),
            None => {}
        }
    }
    outcome
}

/// Finds `marker` and parses the whitespace-delimited token that follows it.
///
/// `None` when the marker is absent.
fn extract(line: &str, marker: &'static str) -> Option<Result<u64, ParseSkip>> {
    let start = line.find(marker)? + marker.len();
    let rest = &line[start..];
    let token = rest.split_whitespace().next().unwrap_or("");
    Some(token.parse().map_err(|_| ParseSkip {
        marker,
        text: rest.trim().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_marker() {
        assert_eq!(parse("Frame count: 20"), vec![ParsedEvent::FrameCount(20)]);
        assert_eq!(parse("Current frame bees: 4"), vec![ParsedEvent::CurrentBees(4)]);
        assert_eq!(parse("Current frame varroa: 0"), vec![ParsedEvent::CurrentVarroa(0)]);
        assert_eq!(parse("Unique bees: 10"), vec![ParsedEvent::UniqueBees(10)]);
        assert_eq!(parse("Unique varroa: 2"), vec![ParsedEvent::UniqueVarroa(2)]);
    }

    #[test]
    fn test_unrelated_lines_are_ignored() {
        assert!(parse("Label: bee Track ID: 3 Confidence: 0.91").is_empty());
        assert!(parse("Total bees: 40").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_multiple_markers_on_one_line() {
        let events = parse("Frame count: 30 Unique bees: 12 Unique varroa: 1");
        assert_eq!(
            events,
            vec![
                ParsedEvent::UniqueBees(12),
                ParsedEvent::UniqueVarroa(1),
                ParsedEvent::FrameCount(30),
            ]
        );
    }

    #[test]
    fn test_malformed_value_skips_only_that_marker() {
        let outcome = parse_line("Unique bees: lots Unique varroa: 3");
        assert_eq!(outcome.events, vec![ParsedEvent::UniqueVarroa(3)]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].marker, UNIQUE_BEES);
    }

    #[test]
    fn test_malformed_values() {
        for line in ["Frame count:", "Frame count: -3", "Frame count: 12abc", "Frame count: 1.5"] {
            let outcome = parse_line(line);
            assert!(outcome.events.is_empty(), "{line}");
            assert_eq!(outcome.skipped.len(), 1, "{line}");
        }
    }

    #[test]
    fn test_surrounding_whitespace_and_prefix() {
        assert_eq!(
            parse("[detector]   Frame count:    7   "),
            vec![ParsedEvent::FrameCount(7)]
        );
    }
}
