use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (trips, media, moments, permissions)");
        conn.execute_batch(
            "
            CREATE TABLE trips (
                id              TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                start_date      TEXT NOT NULL,
                end_date        TEXT NOT NULL,
                cover_image     TEXT,
                owner_id        TEXT NOT NULL,
                share_slug      TEXT UNIQUE,
                share_code      TEXT,
                share_enabled   INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE trip_permissions (
                trip_id         TEXT NOT NULL REFERENCES trips(id),
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL CHECK (role IN ('owner', 'collaborator', 'viewer')),
                granted_via     TEXT NOT NULL,
                invited_by      TEXT NOT NULL,
                invited_at      TEXT NOT NULL,
                accepted_at     TEXT,
                PRIMARY KEY (trip_id, user_id)
            );

            CREATE INDEX idx_trip_permissions_user
                ON trip_permissions(user_id);

            -- At most one owner per trip
            CREATE UNIQUE INDEX uq_trip_permissions_owner
                ON trip_permissions(trip_id) WHERE role = 'owner';

            CREATE TABLE media_items (
                id              TEXT PRIMARY KEY,
                trip_id         TEXT NOT NULL REFERENCES trips(id),
                storage_ref     TEXT NOT NULL,
                thumbnail_ref   TEXT,
                note            TEXT NOT NULL DEFAULT '',
                uploaded_by     TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_media_items_trip
                ON media_items(trip_id);

            CREATE TABLE moments (
                id              TEXT PRIMARY KEY,
                trip_id         TEXT NOT NULL REFERENCES trips(id),
                title           TEXT NOT NULL DEFAULT '',
                media_ids       TEXT NOT NULL DEFAULT '[]',
                layout          TEXT NOT NULL DEFAULT '{}',
                created_by      TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX idx_moments_trip
                ON moments(trip_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
