//! Idempotent schema bootstrap, executed at startup.
//!
//! `updated_at` is trigger-maintained and strictly monotonic per row, even
//! when two writes land inside the same clock tick.

pub(crate) const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS resource (
        uuid               UUID PRIMARY KEY,
        api_version        TEXT NOT NULL,
        kind               TEXT NOT NULL,
        name               TEXT NOT NULL,
        namespace          TEXT NOT NULL,
        resource_version   TEXT,
        created_at         TIMESTAMPTZ NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
        cluster_deleted_ts TIMESTAMPTZ,
        data               JSONB NOT NULL
    )",
    r"
    CREATE INDEX IF NOT EXISTS resource_list_idx
        ON resource (namespace, kind, api_version, created_at, uuid)",
    r"
    CREATE OR REPLACE FUNCTION resource_set_updated_at() RETURNS trigger AS $$
    BEGIN
        NEW.updated_at := now();
        IF NEW.updated_at <= OLD.updated_at THEN
            NEW.updated_at := OLD.updated_at + interval '1 microsecond';
        END IF;
        RETURN NEW;
    END
    $$ LANGUAGE plpgsql",
    r"DROP TRIGGER IF EXISTS resource_updated_at ON resource",
    r"
    CREATE TRIGGER resource_updated_at
        BEFORE UPDATE ON resource
        FOR EACH ROW EXECUTE FUNCTION resource_set_updated_at()",
    r"
    CREATE TABLE IF NOT EXISTS label (
        uuid  UUID NOT NULL REFERENCES resource (uuid) ON DELETE CASCADE,
        key   TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (uuid, key)
    )",
    r"CREATE INDEX IF NOT EXISTS label_kv_idx ON label (key, value)",
    r"
    CREATE TABLE IF NOT EXISTS owner_reference (
        uuid       UUID NOT NULL REFERENCES resource (uuid) ON DELETE CASCADE,
        owner_uuid UUID NOT NULL,
        PRIMARY KEY (uuid, owner_uuid)
    )",
    r"CREATE INDEX IF NOT EXISTS owner_reference_owner_idx ON owner_reference (owner_uuid)",
    r"
    CREATE TABLE IF NOT EXISTS log_url (
        uuid           UUID NOT NULL REFERENCES resource (uuid) ON DELETE CASCADE,
        container_name TEXT NOT NULL,
        url            TEXT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS log_url_uuid_idx ON log_url (uuid)",
];
