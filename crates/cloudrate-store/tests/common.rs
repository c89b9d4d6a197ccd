//! Common fixtures for storage integration tests.

#![allow(dead_code)] // Some fixtures are used by different test files

use chrono::{DateTime, TimeZone, Utc};
use cloudrate_core::{Attributes, DataFrame, DataPoint, Decimal, TotalResult};
use cloudrate_store::record::PointRecord;

/// Scope every fixture is pushed under.
pub const SCOPE: &str = "tenant-a";

/// 2024-01-01 at `hour`:00 UTC.
pub fn hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

/// A point grouped by `project_id`, with a `flavor` metadata value.
pub fn point(project: &str, qty: i64, price: i64) -> DataPoint {
    let groupby: Attributes = [("project_id".to_string(), project.to_string())].into();
    let metadata: Attributes = [("flavor".to_string(), "m1.small".to_string())].into();
    DataPoint::new("instance", Decimal::from(qty), Decimal::from(price), groupby, metadata)
}

/// The four reference points in one frame covering hour 0.
///
/// `(compute, p1, 10, 100)`, `(volume, p1, 5, 50)`, `(compute, p2, 2, 20)`,
/// `(compute, p1, 8, 80)`.
pub fn scenario_frame() -> DataFrame {
    let mut frame = DataFrame::new(hour(0), hour(1)).unwrap();
    frame.add_point(point("p1", 10, 100), "compute");
    frame.add_point(point("p1", 5, 50), "volume");
    frame.add_point(point("p2", 2, 20), "compute");
    frame.add_point(point("p1", 8, 80), "compute");
    frame
}

/// The reference points as stored records, in push order.
pub fn scenario_records() -> Vec<PointRecord> {
    let frame = scenario_frame();
    frame
        .iter_points()
        .map(|(metric_type, point)| PointRecord::from_point(metric_type, point, frame.start(), frame.end()))
        .collect()
}

/// Assert totals grouped by `(type, project_id)` over the reference points.
pub fn assert_scenario_totals(result: &TotalResult) {
    assert_eq!(result.total, 3, "{result:?}");
    assert_eq!(result.results.len(), 3);
    for (metric_type, project, qty, rate) in [
        ("compute", "p1", 18, 180),
        ("volume", "p1", 5, 50),
        ("compute", "p2", 2, 20),
    ] {
        let row = result
            .results
            .iter()
            .find(|r| r.groupby["type"] == metric_type && r.groupby["project_id"] == project)
            .unwrap_or_else(|| panic!("missing group ({metric_type}, {project})"));
        assert_eq!(row.qty, Decimal::from(qty), "qty of ({metric_type}, {project})");
        assert_eq!(row.rate, Decimal::from(rate), "rate of ({metric_type}, {project})");
        assert_eq!(row.begin, hour(0));
        assert_eq!(row.end, hour(1));
    }
}
