// Column layout matches databases written by earlier versions of the scraper,
// so existing archives can be appended to without migration.
pub const SCHEMA: &str = r#"
-- one row per fetched timing frame, rowid gives insertion order
CREATE TABLE IF NOT EXISTS requests (
    timestamp TEXT,
    json TEXT
);
"#;

pub const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS requests;
"#;
