use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "coursed.sqlite3";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            rating REAL NOT NULL DEFAULT 0,
            capacity INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(owner_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS collections(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            rating REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(owner_id) REFERENCES profiles(id)
        )",
        [],
    )?;

    // One row per rated entity; entity_kind is 'course' or 'collection'.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS star_buckets(
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            stars_1 INTEGER NOT NULL DEFAULT 0,
            stars_2 INTEGER NOT NULL DEFAULT 0,
            stars_3 INTEGER NOT NULL DEFAULT 0,
            stars_4 INTEGER NOT NULL DEFAULT 0,
            stars_5 INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(entity_kind, entity_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS themes(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            capacity INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_themes_course ON themes(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            theme_id TEXT NOT NULL,
            title TEXT NOT NULL,
            capacity INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(theme_id) REFERENCES themes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_theme ON lessons(theme_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS steps(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            capacity INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_steps_lesson ON steps(lesson_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            profile_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            status TEXT,
            achieved INTEGER NOT NULL DEFAULT 0,
            grade INTEGER,
            added_at TEXT,
            PRIMARY KEY(profile_id, course_id),
            FOREIGN KEY(profile_id) REFERENCES profiles(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS collection_members(
            profile_id TEXT NOT NULL,
            collection_id TEXT NOT NULL,
            grade INTEGER,
            added_at TEXT,
            PRIMARY KEY(profile_id, collection_id),
            FOREIGN KEY(profile_id) REFERENCES profiles(id),
            FOREIGN KEY(collection_id) REFERENCES collections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_collection_members_collection ON collection_members(collection_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profile_themes(
            profile_id TEXT NOT NULL,
            theme_id TEXT NOT NULL,
            achieved INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(profile_id, theme_id),
            FOREIGN KEY(profile_id) REFERENCES profiles(id),
            FOREIGN KEY(theme_id) REFERENCES themes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profile_lessons(
            profile_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            achieved INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(profile_id, lesson_id),
            FOREIGN KEY(profile_id) REFERENCES profiles(id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profile_steps(
            profile_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'studying',
            achieved INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(profile_id, step_id),
            FOREIGN KEY(profile_id) REFERENCES profiles(id),
            FOREIGN KEY(step_id) REFERENCES steps(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profile_themes_theme ON profile_themes(theme_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profile_lessons_lesson ON profile_lessons(lesson_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profile_steps_step ON profile_steps(step_id)",
        [],
    )?;

    Ok(())
}

/// `table` is always one of our own table names, never request input.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?)");
    conn.query_row(&sql, [id], |r| r.get(0))
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}
