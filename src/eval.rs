//! Threshold evaluation.
//!
//! A sample is checked against each rule in its rule set. Levels are
//! scanned from "9" down to "0" so the highest broken severity wins; a
//! sample breaking no configured level produces a level-0 "Ok." event,
//! which is how a previously alarmed condition clears.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error};

use crate::alarm::AlarmEvent;
use crate::lookup::Rule;
use crate::metric::{is_internal_metric, MetricValue, Sample};

const LEVELS: [&str; 10] = ["9", "8", "7", "6", "5", "4", "3", "2", "1", "0"];

/// Compare an integer value against a threshold. Returns whether the
/// predicate holds and the value's text used verbatim in alarm messages.
pub fn cmp_int(pred: &str, value: i64, threshold: i64) -> (bool, String) {
    let broken = match pred {
        "<" => value < threshold,
        "<=" => value <= threshold,
        "==" => value == threshold,
        ">=" => value >= threshold,
        ">" => value > threshold,
        "!=" => value != threshold,
        _ => {
            error!(predicate = pred, "unknown predicate");
            return (false, String::new());
        }
    };
    (broken, value.to_string())
}

/// Compare a floating point value against an integer threshold.
pub fn cmp_real(pred: &str, value: f64, threshold: i64) -> (bool, String) {
    let threshold = threshold as f64;
    let broken = match pred {
        "<" => value < threshold,
        "<=" => value <= threshold,
        "==" => value == threshold,
        ">=" => value >= threshold,
        ">" => value > threshold,
        "!=" => value != threshold,
        _ => {
            error!(predicate = pred, "unknown predicate");
            return (false, String::new());
        }
    };
    (broken, format!("{value:.3}"))
}

/// Evaluate one sample against its rule set, producing one alarm event
/// per gated rule. A rule is gated in when the sample is an internal
/// metric or the sample's first tag names the rule id.
pub fn evaluate_sample(
    sample: &Sample,
    rules: &HashMap<String, Rule>,
    api_version: &str,
) -> Vec<AlarmEvent> {
    let internal = is_internal_metric(&sample.path);
    let mut events = Vec::new();

    for rule in rules.values() {
        let gated = internal || sample.tags.first().is_some_and(|t| t == &rule.id);
        if !gated {
            continue;
        }

        debug!(
            path = %sample.path,
            asset_id = sample.asset_id,
            rule = %rule.id,
            "evaluating metric against rule",
        );

        let mut level = "0";
        let mut broken_threshold = 0i64;
        let mut repr = String::new();

        for lvl in LEVELS {
            let Some(&threshold) = rule.thresholds.get(lvl) else {
                continue;
            };

            let (broken, value_repr) = match sample.value {
                MetricValue::Integer(v) => cmp_int(&rule.predicate, v, threshold),
                MetricValue::Real(v) => cmp_real(&rule.predicate, v, threshold),
            };

            if broken {
                level = lvl;
                broken_threshold = threshold;
                repr = value_repr;
                break;
            }
        }

        let message = if level == "0" {
            "Ok.".to_string()
        } else {
            format!(
                "Metric {} has broken threshold. Value {} {} {}",
                sample.path, repr, rule.predicate, broken_threshold,
            )
        };

        let oncall = if rule.oncall.is_empty() {
            "No oncall information available".to_string()
        } else {
            rule.oncall.clone()
        };

        events.push(AlarmEvent {
            source: format!("{} / {}", rule.meta_targethost, rule.meta_source),
            event_id: rule.id.clone(),
            version: api_version.to_string(),
            sourcehost: rule.meta_targethost.clone(),
            oncall,
            targethost: rule.meta_targethost.clone(),
            message,
            level: level.parse().unwrap_or(0),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            check: format!("cyclone({})", sample.path),
            monitoring: rule.meta_monitoring.clone(),
            team: rule.meta_team.clone(),
        });
    }

    events
}
