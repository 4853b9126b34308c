//! Route summary derived from the current segments.
//!
//! The summary is recomputed on every save and never cached: distance and
//! ascent totals, unpaved share, loop detection and the location tags shown
//! in the route index.

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

use crate::Segment;

/// Start and end closer than this make a loop (meters).
pub const LOOP_THRESHOLD_METERS: f64 = 5000.0;

/// Country every route is tagged with before segment metadata is applied.
pub const DEFAULT_COUNTRY: &str = "Australia";

/// Aggregate statistics over all segments of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    /// Total distance in kilometers, one decimal
    pub total_distance: f64,
    /// Total ascent in meters, rounded
    pub total_ascent: f64,
    /// Unpaved share of the distance, 0-100
    pub unpaved_percentage: u32,
    pub is_loop: bool,
    pub countries: Vec<String>,
    pub states: Vec<String>,
    pub lgas: Vec<String>,
}

/// Great-circle distance between two `[lng, lat]` coordinates in meters.
pub fn haversine_distance(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    Haversine::distance(Point::new(a[0], a[1]), Point::new(b[0], b[1]))
}

/// Length of a polyline of `[lng, lat]` coordinates in meters.
pub fn polyline_length(coords: &[[f64; 2]]) -> f64 {
    coords
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

fn push_unique(list: &mut Vec<String>, value: &Option<String>) {
    if let Some(v) = value {
        if !v.is_empty() && !list.contains(v) {
            list.push(v.clone());
        }
    }
}

/// Compute the summary for `segments`. Returns `None` for an empty route.
pub fn compute_route_summary(segments: &[Segment]) -> Option<RouteSummary> {
    if segments.is_empty() {
        return None;
    }

    let mut total_distance = 0.0;
    let mut total_ascent = 0.0;
    let mut total_unpaved = 0.0;
    let mut is_loop = true;
    let mut countries = vec![DEFAULT_COUNTRY.to_string()];
    let mut states = Vec::new();
    let mut lgas = Vec::new();

    let mut first_start: Option<[f64; 2]> = None;
    let mut last_end: Option<[f64; 2]> = None;

    for (index, segment) in segments.iter().enumerate() {
        let coords = segment.coordinates();

        // Prefer imported statistics, fall back to the geometry itself
        let distance = match segment.statistics {
            Some(stats) if stats.total_distance > 0.0 => stats.total_distance,
            _ => polyline_length(&coords),
        };
        total_distance += distance;
        total_ascent += segment.statistics.map_or(0.0, |s| s.elevation_gain);

        let unpaved: f64 = segment
            .unpaved_sections
            .iter()
            .map(|s| polyline_length(&s.coordinates))
            .sum();
        total_unpaved += unpaved.min(distance);

        if coords.len() > 1 {
            let start = coords[0];
            let end = coords[coords.len() - 1];
            if index == 0 {
                first_start = Some(start);
            }
            if index == segments.len() - 1 {
                last_end = Some(end);
            }

            let segment_is_loop = haversine_distance(&start, &end) < LOOP_THRESHOLD_METERS;
            if segments.len() == 1 {
                is_loop = segment_is_loop;
            } else if !segment_is_loop {
                is_loop = false;
            }
        }

        if let Some(metadata) = &segment.metadata {
            push_unique(&mut countries, &metadata.country);
            push_unique(&mut states, &metadata.state);
            push_unique(&mut lgas, &metadata.lga);
        }
    }

    // A chain of point-to-point segments can still close into a loop
    if !is_loop && segments.len() > 1 {
        if let (Some(start), Some(end)) = (first_start, last_end) {
            if haversine_distance(&start, &end) < LOOP_THRESHOLD_METERS {
                is_loop = true;
            }
        }
    }

    let unpaved_percentage = if total_distance > 0.0 {
        ((total_unpaved / total_distance) * 100.0).round().clamp(0.0, 100.0) as u32
    } else {
        0
    };

    Some(RouteSummary {
        total_distance: (total_distance / 1000.0 * 10.0).round() / 10.0,
        total_ascent: total_ascent.round(),
        unpaved_percentage,
        is_loop,
        countries,
        states,
        lgas,
    })
}
