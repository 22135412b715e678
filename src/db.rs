use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("exambook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            surname TEXT NOT NULL,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            dni TEXT,
            course TEXT,
            academic_year TEXT,
            previous_course TEXT,
            promoted_at TEXT,
            validated_by TEXT,
            validated_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role_status ON users(role, status)",
        [],
    )?;

    // Older workspaces predate the promotion columns. Add if needed.
    ensure_users_promotion_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT,
            year INTEGER,
            division TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_tables(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            subject_name TEXT,
            teacher_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room TEXT NOT NULL,
            max_students INTEGER NOT NULL,
            cancelled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_tables_teacher ON exam_tables(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_tables_subject ON exam_tables(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reservations(
            id TEXT PRIMARY KEY,
            exam_table_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            cancelled_at TEXT,
            FOREIGN KEY(exam_table_id) REFERENCES exam_tables(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    // One confirmed reservation per (exam, student) pair, enforced by the
    // store instead of a query-then-write check.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_active
         ON reservations(exam_table_id, student_id) WHERE status = 'confirmed'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reservations_exam ON reservations(exam_table_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reservations_student ON reservations(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            exam_table_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            observations TEXT NOT NULL DEFAULT '',
            subject_name TEXT,
            recorded_by TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT,
            FOREIGN KEY(exam_table_id) REFERENCES exam_tables(id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            UNIQUE(exam_table_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_exam ON grades(exam_table_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    // Append-only snapshots of pre-edit grade values, oldest first by seq.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_history(
            grade_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            score REAL NOT NULL,
            observations TEXT NOT NULL DEFAULT '',
            updated_by TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(grade_id, seq),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            exam_table_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            recorded_by TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT,
            FOREIGN KEY(exam_table_id) REFERENCES exam_tables(id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            UNIQUE(exam_table_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_exam ON attendance(exam_table_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_history(
            attendance_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            status TEXT NOT NULL,
            updated_by TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(attendance_id, seq),
            FOREIGN KEY(attendance_id) REFERENCES attendance(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_users_promotion_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "users", "academic_year")? {
        conn.execute("ALTER TABLE users ADD COLUMN academic_year TEXT", [])?;
    }
    if !table_has_column(conn, "users", "previous_course")? {
        conn.execute("ALTER TABLE users ADD COLUMN previous_course TEXT", [])?;
    }
    if !table_has_column(conn, "users", "promoted_at")? {
        conn.execute("ALTER TABLE users ADD COLUMN promoted_at TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
