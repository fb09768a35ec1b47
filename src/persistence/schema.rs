//! Store schema and connection setup.
//!
//! Migrations are append-only: never edit a shipped `M::up`, add a new one.

use log::info;
use rusqlite::{Connection, OpenFlags};
use rusqlite_migration::{Migrations, M};

use crate::error::Result;

/// Path that selects a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

const V1_INITIAL: &str = r#"
-- Activity metadata (always loaded)
CREATE TABLE activities (
    id TEXT PRIMARY KEY,
    sport_type TEXT NOT NULL,
    min_lat REAL NOT NULL,
    max_lat REAL NOT NULL,
    min_lng REAL NOT NULL,
    max_lng REAL NOT NULL,
    point_count INTEGER NOT NULL,
    distance_meters REAL NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Full GPS tracks (loaded on demand)
CREATE TABLE gps_tracks (
    activity_id TEXT PRIMARY KEY,
    track_data BLOB NOT NULL,
    point_count INTEGER NOT NULL,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

-- Simplified signatures for grouping (LRU cached)
CREATE TABLE signatures (
    activity_id TEXT PRIMARY KEY,
    points BLOB NOT NULL,
    start_point_lat REAL NOT NULL,
    start_point_lng REAL NOT NULL,
    end_point_lat REAL NOT NULL,
    end_point_lng REAL NOT NULL,
    total_distance REAL NOT NULL,
    point_count INTEGER NOT NULL,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

-- Cumulative seconds per GPS point
CREATE TABLE time_streams (
    activity_id TEXT PRIMARY KEY,
    times BLOB NOT NULL,
    point_count INTEGER NOT NULL,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

CREATE TABLE activity_metrics (
    activity_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    date INTEGER NOT NULL,
    distance REAL NOT NULL,
    moving_time INTEGER NOT NULL,
    elapsed_time INTEGER NOT NULL,
    elevation_gain REAL NOT NULL,
    avg_hr INTEGER,
    avg_power INTEGER,
    sport_type TEXT NOT NULL,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

-- Computed route groups
CREATE TABLE route_groups (
    id TEXT PRIMARY KEY,
    representative_id TEXT NOT NULL,
    activity_ids TEXT NOT NULL,
    sport_type TEXT NOT NULL,
    bounds_min_lat REAL,
    bounds_max_lat REAL,
    bounds_min_lng REAL,
    bounds_max_lng REAL,
    best_time REAL,
    best_activity_id TEXT
);

-- Per-activity match info within route groups
CREATE TABLE activity_matches (
    route_id TEXT NOT NULL,
    activity_id TEXT NOT NULL,
    match_percentage REAL NOT NULL,
    direction TEXT NOT NULL,
    PRIMARY KEY (route_id, activity_id),
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

-- User names, keyed independently of detection runs
CREATE TABLE route_names (
    route_id TEXT PRIMARY KEY,
    custom_name TEXT NOT NULL
);

CREATE TABLE section_names (
    section_id TEXT PRIMARY KEY,
    custom_name TEXT NOT NULL
);

-- Detected sections: scalar columns for summaries, blobs for detail
CREATE TABLE sections (
    id TEXT PRIMARY KEY,
    name TEXT,
    sport_type TEXT NOT NULL,
    representative_activity_id TEXT NOT NULL,
    reference_pinned INTEGER NOT NULL DEFAULT 0,
    medoid_activity_id TEXT NOT NULL,
    visit_count INTEGER NOT NULL,
    distance_meters REAL NOT NULL,
    confidence REAL NOT NULL,
    average_spread REAL NOT NULL,
    scale TEXT NOT NULL,
    min_lat REAL NOT NULL,
    max_lat REAL NOT NULL,
    min_lng REAL NOT NULL,
    max_lng REAL NOT NULL,
    polyline BLOB NOT NULL,
    medoid_polyline BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Every traversal of a section, one row per portion
CREATE TABLE section_activities (
    section_id TEXT NOT NULL,
    activity_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    start_index INTEGER NOT NULL,
    end_index INTEGER NOT NULL,
    distance_meters REAL NOT NULL,
    PRIMARY KEY (section_id, activity_id, start_index),
    FOREIGN KEY (section_id) REFERENCES sections(id) ON DELETE CASCADE,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

-- User-created sections
CREATE TABLE custom_sections (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    polyline_json TEXT NOT NULL,
    source_activity_id TEXT NOT NULL,
    start_index INTEGER NOT NULL,
    end_index INTEGER NOT NULL,
    sport_type TEXT NOT NULL,
    distance_meters REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE custom_section_matches (
    section_id TEXT NOT NULL,
    activity_id TEXT NOT NULL,
    start_index INTEGER NOT NULL,
    end_index INTEGER NOT NULL,
    direction TEXT NOT NULL,
    distance_meters REAL NOT NULL,
    PRIMARY KEY (section_id, activity_id, start_index),
    FOREIGN KEY (section_id) REFERENCES custom_sections(id) ON DELETE CASCADE,
    FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
);

CREATE INDEX idx_activities_sport ON activities(sport_type);
CREATE INDEX idx_activities_created ON activities(created_at);
CREATE INDEX idx_groups_sport ON route_groups(sport_type);
CREATE INDEX idx_activity_matches_activity ON activity_matches(activity_id);
CREATE INDEX idx_sections_sport ON sections(sport_type);
CREATE INDEX idx_section_activities_activity ON section_activities(activity_id);
CREATE INDEX idx_custom_section_matches_activity ON custom_section_matches(activity_id);
"#;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(V1_INITIAL)])
}

/// Open (creating if needed) and migrate a store.
///
/// File-backed stores use WAL so the detection worker can read while the
/// engine writes.
pub fn open_store(path: &str) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if path != IN_MEMORY_PATH {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        info!("[Store] Opened {} (journal_mode={})", path, mode);
    }

    migrations().to_latest(&mut conn)?;
    Ok(conn)
}

/// Read-only connection for the detection worker.
pub fn open_reader(path: &str) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_open_in_memory_enables_foreign_keys() {
        let conn = open_store(IN_MEMORY_PATH).unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sections'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
