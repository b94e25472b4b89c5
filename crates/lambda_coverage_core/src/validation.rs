//! Checks applied to coverage files before they are merged.
//!
//! Structural validation rejects anything that is not a report object with
//! `files` and `totals`. Integrity validation rejects totals that are
//! missing or negative and only warns about a stored percentage that
//! disagrees with the counts.

use serde_json::{Map, Value};

const PERCENT_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parses `bytes` as JSON and checks the report shape. Returns the parsed
/// document on success.
pub fn validate_structure(bytes: &[u8]) -> Result<Value, String> {
    let document: Value =
        serde_json::from_slice(bytes).map_err(|error| format!("invalid JSON format: {error}"))?;

    let object = document
        .as_object()
        .ok_or_else(|| "coverage data must be a JSON object".to_string())?;

    for section in ["files", "totals"] {
        match object.get(section) {
            None => return Err(format!("missing required section '{section}'")),
            Some(value) if !value.is_object() => {
                return Err(format!("section '{section}' must be an object"));
            }
            Some(_) => {}
        }
    }

    Ok(document)
}

pub fn validate_integrity(document: &Value) -> IntegrityOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(totals) = document.get("totals").and_then(Value::as_object) else {
        errors.push("totals section is missing".to_string());
        return IntegrityOutcome { errors, warnings };
    };

    let covered = required_count(totals, "covered_lines", &mut errors);
    let statements = required_count(totals, "num_statements", &mut errors);

    if let (Some(covered), Some(statements)) = (covered, statements) {
        if covered > statements {
            warnings.push(format!(
                "covered_lines ({covered}) exceeds num_statements ({statements})"
            ));
        }

        let covered_branches = optional_count(totals, "covered_branches");
        let branches = optional_count(totals, "num_branches");

        if let Some(stored) = totals.get("percent_covered").and_then(Value::as_f64) {
            let measured = statements + branches;
            if measured > 0.0 {
                let expected = (covered + covered_branches) / measured * 100.0;
                if (stored - expected).abs() > PERCENT_TOLERANCE {
                    warnings.push(format!(
                        "percent_covered {stored:.2} does not match computed {expected:.2}"
                    ));
                }
            }
        }
    }

    IntegrityOutcome { errors, warnings }
}

// Branch counts are absent from reports collected without branch tracking.
fn optional_count(totals: &Map<String, Value>, field: &str) -> f64 {
    totals
        .get(field)
        .and_then(Value::as_f64)
        .filter(|count| *count >= 0.0)
        .unwrap_or(0.0)
}

fn required_count(
    totals: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<f64> {
    match totals.get(field) {
        None => {
            errors.push(format!("missing totals field '{field}'"));
            None
        }
        Some(value) => match value.as_f64() {
            None => {
                errors.push(format!("totals field '{field}' must be numeric"));
                None
            }
            Some(number) if number < 0.0 => {
                errors.push(format!("totals field '{field}' cannot be negative"));
                None
            }
            Some(number) => Some(number),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::probe;
    use crate::tracker::{LineTracker, SourceFilter, TrackingEngine};

    use super::*;

    #[test]
    fn accepts_minimal_report_shape() {
        let bytes = br#"{"files": {}, "totals": {"covered_lines": 0, "num_statements": 0}}"#;
        let document = validate_structure(bytes).unwrap();
        assert!(validate_integrity(&document).is_valid());
    }

    #[test]
    fn rejects_non_json_and_missing_sections() {
        assert!(validate_structure(b"not json")
            .unwrap_err()
            .starts_with("invalid JSON format"));
        assert_eq!(
            validate_structure(br#"{"files": {}}"#).unwrap_err(),
            "missing required section 'totals'"
        );
        assert_eq!(
            validate_structure(br#"{"files": [], "totals": {}}"#).unwrap_err(),
            "section 'files' must be an object"
        );
        assert!(validate_structure(b"[1, 2]").is_err());
    }

    #[test]
    fn negative_or_missing_counts_are_errors() {
        let outcome = validate_integrity(&json!({
            "files": {},
            "totals": {"covered_lines": -1}
        }));
        assert_eq!(outcome.errors.len(), 2);
        assert!(!outcome.is_valid());
    }

    #[test]
    fn percentage_drift_only_warns() {
        let outcome = validate_integrity(&json!({
            "files": {},
            "totals": {"covered_lines": 1, "num_statements": 4, "percent_covered": 80.0}
        }));
        assert!(outcome.is_valid());
        assert_eq!(outcome.warnings.len(), 1);

        let outcome = validate_integrity(&json!({
            "files": {},
            "totals": {"covered_lines": 1, "num_statements": 4, "percent_covered": 25.05}
        }));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn branch_counts_enter_the_expected_percentage() {
        const FILE: &str = "validation_test/src/router.rs";
        let filter = SourceFilter::new(&[FILE.to_string()], &[]).unwrap();
        let mut tracker = LineTracker::new(true, filter);
        tracker.declare_lines(FILE, [1, 2, 3, 4]);
        tracker.declare_arcs(FILE, [(2, 3), (2, 4)]);

        tracker.start().unwrap();
        probe::record_line(FILE, 1);
        probe::record_line(FILE, 2);
        probe::record_branch(FILE, 2, 3);
        probe::record_line(FILE, 3);
        tracker.stop().unwrap();

        let report = tracker.report().unwrap();
        assert_eq!(report.totals.covered_branches, 1);
        let document = serde_json::to_value(&report).unwrap();

        let outcome = validate_integrity(&document);
        assert!(outcome.is_valid());
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    }
}
