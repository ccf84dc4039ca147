//! Active rule descriptors attached to cameras.
//!
//! A rule pairs a violation type with an evaluation method and a polygon
//! region in normalized frame coordinates. The configuration service sends
//! polygons as a flat comma separated list (`"x1,y1,x2,y2,..."`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::camera::CameraId;
use crate::detection::DetectorKind;
use crate::error::{ModelError, ModelResult};

/// Violation category a rule checks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    HardhatViolation,
    RestrictedAreaViolation,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::HardhatViolation => "hardhat_violation",
            RuleType::RestrictedAreaViolation => "restricted_area_violation",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evaluation method version of a rule.
///
/// - `hardhat_violation/v1`: head region of each person checked against hardhat detections
/// - `restricted_area_violation/v1`: a detected ankle inside the polygon
/// - `restricted_area_violation/v2`: bbox overlap with the polygon above the trigger threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMethod {
    V1,
    V2,
}

impl EvaluationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMethod::V1 => "v1",
            EvaluationMethod::V2 => "v2",
        }
    }
}

/// Department that owns a rule and receives its violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Department {
    #[serde(alias = "isg")]
    Isg,
    #[serde(alias = "kalite")]
    Kalite,
    #[serde(alias = "guvenlik")]
    Guvenlik,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::Isg => "ISG",
            Department::Kalite => "KALITE",
            Department::Guvenlik => "GUVENLIK",
        }
    }
}

impl FromStr for Department {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ISG" => Ok(Department::Isg),
            "KALITE" => Ok(Department::Kalite),
            "GUVENLIK" => Ok(Department::Guvenlik),
            _ => Err(ModelError::unknown_variant("department", s)),
        }
    }
}

/// A point in normalized (0..1) frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
}

impl NormalizedPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Closed polygon in normalized coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RulePolygon {
    points: Vec<NormalizedPoint>,
}

impl RulePolygon {
    /// Build a polygon from points. At least three points are required.
    pub fn new(points: Vec<NormalizedPoint>) -> ModelResult<Self> {
        if points.len() < 3 {
            return Err(ModelError::invalid_polygon(format!(
                "need at least 3 points, got {}",
                points.len()
            )));
        }
        if let Some(p) = points
            .iter()
            .find(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y))
        {
            return Err(ModelError::invalid_polygon(format!(
                "point ({}, {}) is outside the normalized range",
                p.x, p.y
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[NormalizedPoint] {
        &self.points
    }

    /// Even-odd ray casting containment test.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (pi, pj) = (self.points[i], self.points[j]);
            if (pi.y > y) != (pj.y > y) {
                let x_cross = (pj.x - pi.x) * (y - pi.y) / (pj.y - pi.y) + pi.x;
                if x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

impl FromStr for RulePolygon {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f32>()
                    .map_err(|_| ModelError::invalid_polygon(format!("not a number: {:?}", v)))
            })
            .collect::<ModelResult<Vec<f32>>>()?;

        if values.len() % 2 != 0 {
            return Err(ModelError::invalid_polygon(format!(
                "odd number of coordinates ({})",
                values.len()
            )));
        }

        let points = values
            .chunks_exact(2)
            .map(|c| NormalizedPoint::new(c[0], c[1]))
            .collect();
        Self::new(points)
    }
}

impl TryFrom<String> for RulePolygon {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RulePolygon> for String {
    fn from(polygon: RulePolygon) -> Self {
        polygon
            .points
            .iter()
            .map(|p| format!("{},{}", p.x, p.y))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn default_trigger_threshold() -> f32 {
    0.5
}

/// Accept the threshold as a number or as numeric text.
fn deserialize_threshold<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(v) => Ok(v),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A rule attached to a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActiveRule {
    pub rule_uuid: String,
    pub camera_uuid: CameraId,
    pub rule_type: RuleType,
    pub evaluation_method: EvaluationMethod,
    pub rule_department: Department,
    /// Threshold compared against the rule's score (overlap fraction, confidence)
    #[serde(
        default = "default_trigger_threshold",
        alias = "threshold_value",
        deserialize_with = "deserialize_threshold"
    )]
    pub trigger_threshold: f32,
    #[schemars(with = "String")]
    pub rule_polygon: RulePolygon,
}

impl ActiveRule {
    /// Whether this rule type/method combination is implemented.
    pub fn is_supported(&self) -> bool {
        matches!(
            (self.rule_type, self.evaluation_method),
            (RuleType::HardhatViolation, EvaluationMethod::V1)
                | (RuleType::RestrictedAreaViolation, EvaluationMethod::V1)
                | (RuleType::RestrictedAreaViolation, EvaluationMethod::V2)
        )
    }

    /// Detectors whose output this rule needs.
    pub fn required_detectors(&self) -> &'static [DetectorKind] {
        match self.rule_type {
            RuleType::HardhatViolation => &[DetectorKind::Pose, DetectorKind::Hardhat],
            RuleType::RestrictedAreaViolation => &[DetectorKind::Pose],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_parse_and_format() {
        let polygon: RulePolygon = "0.1,0.1,0.9,0.1,0.9,0.9,0.1,0.9".parse().unwrap();
        assert_eq!(polygon.points().len(), 4);
        let wire: String = polygon.clone().into();
        let reparsed: RulePolygon = wire.parse().unwrap();
        assert_eq!(polygon, reparsed);
    }

    #[test]
    fn test_polygon_rejects_bad_input() {
        assert!("0.1,0.1,0.9".parse::<RulePolygon>().is_err());
        assert!("0.1,0.1,0.9,0.1".parse::<RulePolygon>().is_err());
        assert!("0.1,0.1,0.9,x,0.5,0.5".parse::<RulePolygon>().is_err());
        assert!("0.1,0.1,1.9,0.1,0.5,0.5".parse::<RulePolygon>().is_err());
    }

    #[test]
    fn test_polygon_contains() {
        // L-shaped region
        let polygon: RulePolygon = "0,0,0.5,0,0.5,0.5,1,0.5,1,1,0,1".parse().unwrap();
        assert!(polygon.contains(0.25, 0.25));
        assert!(polygon.contains(0.75, 0.75));
        assert!(!polygon.contains(0.75, 0.25));
        assert!(!polygon.contains(1.5, 0.5));
    }

    #[test]
    fn test_rule_deserialize_from_config_service() {
        let json = r#"{
            "rule_uuid": "5b7d8b0e-39c4-4a7c-9a3b-1d2f2b8a6c11",
            "camera_uuid": "d2040d78-cb94-4a3f-b9cf-b63bdbc2faa5",
            "rule_type": "restricted_area_violation",
            "evaluation_method": "v2",
            "rule_department": "ISG",
            "rule_polygon": "0.1,0.1,0.9,0.1,0.9,0.9"
        }"#;
        let rule: ActiveRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.rule_type, RuleType::RestrictedAreaViolation);
        assert_eq!(rule.evaluation_method, EvaluationMethod::V2);
        assert_eq!(rule.rule_department, Department::Isg);
        assert!((rule.trigger_threshold - 0.5).abs() < f32::EPSILON);
        assert!(rule.is_supported());
        assert_eq!(rule.required_detectors(), &[DetectorKind::Pose]);
    }

    #[test]
    fn test_threshold_as_text() {
        let json = r#"{
            "rule_uuid": "r",
            "camera_uuid": "c",
            "rule_type": "hardhat_violation",
            "evaluation_method": "v1",
            "rule_department": "kalite",
            "threshold_value": "0.35",
            "rule_polygon": "0,0,1,0,1,1"
        }"#;
        let rule: ActiveRule = serde_json::from_str(json).unwrap();
        assert!((rule.trigger_threshold - 0.35).abs() < f32::EPSILON);
        assert_eq!(rule.rule_department, Department::Kalite);
    }

    #[test]
    fn test_hardhat_v2_is_not_supported() {
        let rule = ActiveRule {
            rule_uuid: "r".to_string(),
            camera_uuid: CameraId::from("c"),
            rule_type: RuleType::HardhatViolation,
            evaluation_method: EvaluationMethod::V2,
            rule_department: Department::Isg,
            trigger_threshold: 0.5,
            rule_polygon: "0,0,1,0,1,1".parse().unwrap(),
        };
        assert!(!rule.is_supported());
        assert!(rule.required_detectors().contains(&DetectorKind::Hardhat));
    }

    #[test]
    fn test_department_from_str() {
        assert_eq!("kalite".parse::<Department>().unwrap(), Department::Kalite);
        assert!("finance".parse::<Department>().is_err());
    }
}
