use rusqlite::{params, Connection, OptionalExtension};

pub fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Returns whether the key existed.
pub fn delete(conn: &Connection, key: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_in_memory;

    #[test]
    fn test_get_missing_key() {
        let conn = open_in_memory().unwrap();
        assert_eq!(get(&conn, "nope").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let conn = open_in_memory().unwrap();
        set(&conn, "shell_path", "/bin/bash").unwrap();
        set(&conn, "shell_path", "/bin/zsh").unwrap();
        assert_eq!(get(&conn, "shell_path").unwrap().as_deref(), Some("/bin/zsh"));
    }

    #[test]
    fn test_delete() {
        let conn = open_in_memory().unwrap();
        set(&conn, "viewport", "{}").unwrap();
        assert!(delete(&conn, "viewport").unwrap());
        assert!(!delete(&conn, "viewport").unwrap());
        assert_eq!(get(&conn, "viewport").unwrap(), None);
    }
}
