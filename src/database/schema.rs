pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS event_observations (
        id INTEGER PRIMARY KEY,
        event_name TEXT UNIQUE NOT NULL,
        video_file TEXT NOT NULL,
        video_location TEXT NOT NULL DEFAULT '',
        scene_name TEXT NOT NULL DEFAULT '',
        capture_time INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS computations (
        id INTEGER PRIMARY KEY,
        event_name TEXT NOT NULL,
        method_name TEXT NOT NULL,
        computed_at INTEGER NOT NULL,
        elapsed_seconds REAL NOT NULL,
        host_info TEXT NOT NULL,
        success INTEGER NOT NULL,
        result TEXT NOT NULL,
        result_file TEXT,
        result_file_location TEXT
    );

    -- At most one successful computation per (event, method).
    CREATE UNIQUE INDEX IF NOT EXISTS idx_computations_success
        ON computations(event_name, method_name) WHERE success = 1;

    CREATE INDEX IF NOT EXISTS idx_computations_event ON computations(event_name);

    CREATE TABLE IF NOT EXISTS event_classifications (
        id INTEGER PRIMARY KEY,
        event_name TEXT NOT NULL,
        label TEXT NOT NULL,
        confidence REAL,
        decider TEXT NOT NULL,
        decided_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        task TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        backoff_secs INTEGER NOT NULL,
        depends_on INTEGER REFERENCES jobs(id),
        -- Next dispatch time; the lease deadline while running.
        available_at INTEGER NOT NULL,
        last_error TEXT,
        attachment BLOB,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, id);
    CREATE INDEX IF NOT EXISTS idx_jobs_depends_on ON jobs(depends_on);
";
