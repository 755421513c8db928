//! Request and response bodies of the game routes.

use serde::{Deserialize, Serialize};

use crate::mnist::parse_drawn_coords;

/// A drawn pixel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointDto {
    pub x: usize,
    pub y: usize,
}

/// Either the raw `"(1,2), (3,4)"` string or a list of points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DrawnPoints {
    Text(String),
    Points(Vec<PointDto>),
}

impl DrawnPoints {
    pub fn to_pairs(&self) -> Vec<(usize, usize)> {
        match self {
            DrawnPoints::Text(text) => parse_drawn_coords(text),
            DrawnPoints::Points(points) => points.iter().map(|p| (p.x, p.y)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictDigitRequest {
    #[serde(alias = "drawn_coords")]
    pub points: DrawnPoints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictDigitResponse {
    pub prediction: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatesRequest {
    #[serde(alias = "guess")]
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatesResponse {
    pub coordinates: [f32; 2],
    pub scalar: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteerRequest {
    pub knob_turns: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerResponse {
    pub prediction: String,
}

/// Which games this server has loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamesDto {
    pub digit: bool,
    pub coordinates: bool,
    pub steer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub games: GamesDto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drawn_points_forms() {
        let text: PredictDigitRequest =
            serde_json::from_str(r#"{"points": "(1,2), (3,4)"}"#).unwrap();
        assert_eq!(text.points.to_pairs(), vec![(1, 2), (3, 4)]);

        let list: PredictDigitRequest =
            serde_json::from_str(r#"{"points": [{"x": 5, "y": 6}]}"#).unwrap();
        assert_eq!(list.points.to_pairs(), vec![(5, 6)]);

        let alias: PredictDigitRequest =
            serde_json::from_str(r#"{"drawn_coords": "(7, 8)"}"#).unwrap();
        assert_eq!(alias.points.to_pairs(), vec![(7, 8)]);
    }

    #[test]
    fn test_coordinates_request_alias() {
        let req: CoordinatesRequest = serde_json::from_str(r#"{"guess": "water"}"#).unwrap();
        assert_eq!(req.word, "water");
    }

    #[test]
    fn test_null_prediction_serializes() {
        let json = serde_json::to_value(PredictDigitResponse { prediction: None }).unwrap();
        assert_eq!(json, serde_json::json!({"prediction": null}));
    }
}
