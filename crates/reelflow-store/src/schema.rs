/// Idempotent schema setup, applied at startup in order. The partial unique
/// index keeps `planning_page_id` globally unique while allowing tasks that
/// were created outside the planning database. The composite index matches
/// the claim query's filter-and-order shape exactly.
pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        max_concurrent INTEGER NOT NULL CHECK (max_concurrent >= 1),
        voice_id TEXT NOT NULL DEFAULT '',
        storage_strategy TEXT NOT NULL DEFAULT 'filesystem',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id UUID PRIMARY KEY,
        channel_id TEXT NOT NULL REFERENCES channels(id),
        planning_page_id TEXT,
        title TEXT NOT NULL,
        topic TEXT,
        story_direction TEXT,
        priority TEXT NOT NULL DEFAULT 'normal',
        status TEXT NOT NULL DEFAULT 'queued',
        error_log TEXT NOT NULL DEFAULT '',
        final_video_path TEXT,
        cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (cost_usd >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS tasks_planning_page_id_key
        ON tasks (planning_page_id) WHERE planning_page_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS tasks_claim_order_idx
        ON tasks (status, priority, channel_id, created_at)",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        event_id TEXT PRIMARY KEY,
        payload JSONB NOT NULL,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        received_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS youtube_quota_usage (
        channel_id TEXT NOT NULL,
        date DATE NOT NULL,
        units_used BIGINT NOT NULL DEFAULT 0 CHECK (units_used >= 0),
        daily_limit BIGINT NOT NULL DEFAULT 10000 CHECK (daily_limit > 0),
        PRIMARY KEY (channel_id, date)
    )",
    "CREATE INDEX IF NOT EXISTS youtube_quota_usage_date_idx
        ON youtube_quota_usage (date)",
];
