//! Engine output parser
//!
//! The engine reports telemetry as free text. Numbers are picked out in order
//! of appearance and mapped by position. After the second token is dropped the
//! remaining list maps to duration, views, estimated views, tracks and
//! estimated tracks. Vertices and faces sit at positions 12 and 13 once more
//! than ten tokens remain.

use crate::job::StepKind;
use crate::reconstruction::ReconstructionId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    // ASCII digits only, so every match parses as f64
    Regex::new(r"[-+]?(?:[0-9]*\.[0-9]+|[0-9]+)").unwrap()
});

/// Structured outcome of one engine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub reconstruction_id: ReconstructionId,
    pub step: StepKind,
    pub success: bool,
    pub duration: Option<f64>,
    pub views: Option<f64>,
    pub estimated_views: Option<f64>,
    pub tracks: Option<f64>,
    pub estimated_tracks: Option<f64>,
    pub vertices: Option<f64>,
    pub faces: Option<f64>,
    /// Raw engine output, kept for diagnostics
    pub output: String,
}

impl StepResult {
    /// Result with only the success flag and raw output
    pub fn minimal(
        reconstruction_id: ReconstructionId,
        step: StepKind,
        success: bool,
        output: String,
    ) -> Self {
        Self {
            reconstruction_id,
            step,
            success,
            duration: None,
            views: None,
            estimated_views: None,
            tracks: None,
            estimated_tracks: None,
            vertices: None,
            faces: None,
            output,
        }
    }
}

/// All decimal numbers in `raw`, in order of appearance
pub fn extract_numbers(raw: &str) -> Vec<f64> {
    NUMBER
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

/// Whether the engine reported success for `step`
pub fn is_success(step: StepKind, raw: &str) -> bool {
    match step.success_marker() {
        Some(marker) => raw.contains(marker),
        None => true,
    }
}

/// Turn raw engine output into a [`StepResult`]. Never fails: anything that
/// can't be read ends up as an empty field.
pub fn parse(step: StepKind, reconstruction_id: &ReconstructionId, raw: &str) -> StepResult {
    let success = is_success(step, raw);
    let mut numbers = extract_numbers(raw);

    let mut result = StepResult::minimal(
        reconstruction_id.clone(),
        step,
        success,
        raw.to_string(),
    );

    if numbers.is_empty() {
        return result;
    }

    // The engine prints a duplicate value in second position
    if numbers.len() > 1 {
        numbers.remove(1);
    }

    result.duration = numbers.first().copied();
    result.views = numbers.get(1).copied();
    result.estimated_views = numbers.get(2).copied();
    result.tracks = numbers.get(3).copied();
    result.estimated_tracks = numbers.get(4).copied();

    if numbers.len() > 10 {
        result.vertices = numbers.get(12).copied();
        result.faces = numbers.get(13).copied();
    } else {
        result.vertices = Some(0.0);
        result.faces = Some(0.0);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id() -> ReconstructionId {
        ReconstructionId::from("recon-1")
    }

    #[test]
    fn test_extract_signed_and_fractional() {
        assert_eq!(
            extract_numbers("a -1.5 b +2 c .25 d 7"),
            vec![-1.5, 2.0, 0.25, 7.0]
        );
    }

    #[test]
    fn test_non_ascii_digits_are_not_numbers() {
        // Arabic-Indic and fullwidth digits
        assert_eq!(extract_numbers("t ٣ 1.5 ４ 2"), vec![1.5, 2.0]);

        let result = parse(StepKind::Texture, &id(), "done 9 ٧ 8 7");
        assert_eq!(result.duration, Some(9.0));
        assert_eq!(result.views, Some(7.0));
    }

    #[test]
    fn test_parse_initialization_output() {
        let result = parse(
            StepKind::Initialize,
            &id(),
            "Initialization successful ... 12.3 4 5 6 7",
        );

        assert!(result.success);
        assert_eq!(result.duration, Some(12.3));
        assert_eq!(result.views, Some(5.0));
        assert_eq!(result.estimated_views, Some(6.0));
        assert_eq!(result.tracks, Some(7.0));
        assert_eq!(result.estimated_tracks, None);
        assert_eq!(result.vertices, Some(0.0));
        assert_eq!(result.faces, Some(0.0));
    }

    #[test]
    fn test_parse_no_numbers() {
        let result = parse(StepKind::Initialize, &id(), "no numbers here");

        assert!(!result.success);
        assert_eq!(result.duration, None);
        assert_eq!(result.views, None);
        assert_eq!(result.vertices, None);
        assert_eq!(result.faces, None);
        assert_eq!(result.output, "no numbers here");
    }

    #[test]
    fn test_parse_missing_marker_is_failure() {
        let result = parse(StepKind::Extend, &id(), "Extend failed after 3.0 1 2");
        assert!(!result.success);
        assert_eq!(result.duration, Some(3.0));
    }

    #[test]
    fn test_markerless_steps_succeed() {
        let result = parse(StepKind::Texture, &id(), "");
        assert!(result.success);
        assert_eq!(result.duration, None);
    }

    #[test]
    fn test_single_token_is_kept() {
        let result = parse(StepKind::Refine, &id(), "took 42 seconds");
        assert_eq!(result.duration, Some(42.0));
        assert_eq!(result.views, None);
    }

    #[test]
    fn test_mesh_counts_at_positions_twelve_and_thirteen() {
        // 15 tokens; after dropping the second, index 12 = 1200 and 13 = 2400
        let raw = "Extend successful 9.5 99 10 11 12 13 0 0 0 0 0 0 0 1200 2400";
        let result = parse(StepKind::Extend, &id(), raw);

        assert!(result.success);
        assert_eq!(result.duration, Some(9.5));
        assert_eq!(result.views, Some(10.0));
        assert_eq!(result.estimated_tracks, Some(13.0));
        assert_eq!(result.vertices, Some(1200.0));
        assert_eq!(result.faces, Some(2400.0));
    }

    #[test]
    fn test_long_output_without_mesh_counts() {
        // 12 tokens remain: more than ten, but nothing at 12 or 13
        let raw = "1 2 3 4 5 6 7 8 9 10 11 12 13";
        let result = parse(StepKind::ReconstructMesh, &id(), raw);
        assert_eq!(result.vertices, None);
        assert_eq!(result.faces, None);
    }

    #[test]
    fn test_result_serializes_with_engine_field_names() {
        let result = parse(StepKind::Initialize, &id(), "Initialization successful 1 2 3");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["reconstruction_id"], "recon-1");
        assert_eq!(json["step"], "initialize");
        assert_eq!(json["success"], true);
        assert_eq!(json["duration"], 1.0);
        assert_eq!(json["views"], 3.0);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(raw in ".{0,200}") {
            for step in StepKind::ALL {
                let result = parse(step, &id(), &raw);
                prop_assert_eq!(&result.output, &raw);
            }
        }

        #[test]
        fn prop_duration_is_first_token(values in proptest::collection::vec(0u32..10_000, 1..20)) {
            let raw = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
            let result = parse(StepKind::Texture, &id(), &raw);
            prop_assert_eq!(result.duration, Some(f64::from(values[0])));
            if values.len() > 2 {
                prop_assert_eq!(result.views, Some(f64::from(values[2])));
            }
        }
    }
}
