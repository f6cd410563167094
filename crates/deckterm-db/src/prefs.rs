//! User preferences that survive restarts: the last shell and the viewport size.

use log::warn;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::settings;

pub const KEY_SHELL_PATH: &str = "shell_path";
pub const KEY_VIEWPORT: &str = "viewport";

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub shell_path: Option<String>,
    pub viewport: Viewport,
}

impl Preferences {
    /// Read the stored preferences. Missing or unreadable values fall back to
    /// their defaults.
    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let shell_path = settings::get(conn, KEY_SHELL_PATH)?.filter(|p| !p.trim().is_empty());

        let viewport = match settings::get(conn, KEY_VIEWPORT)? {
            Some(raw) => match serde_json::from_str::<Viewport>(&raw) {
                Ok(v) if v.cols > 0 && v.rows > 0 => v,
                Ok(v) => {
                    warn!("ignoring stored viewport {}x{}", v.cols, v.rows);
                    Viewport::default()
                }
                Err(e) => {
                    warn!("ignoring unreadable stored viewport: {e}");
                    Viewport::default()
                }
            },
            None => Viewport::default(),
        };

        Ok(Self {
            shell_path,
            viewport,
        })
    }

    pub fn save(&self, conn: &Connection) -> rusqlite::Result<()> {
        match &self.shell_path {
            Some(path) => settings::set(conn, KEY_SHELL_PATH, path)?,
            None => {
                settings::delete(conn, KEY_SHELL_PATH)?;
            }
        }

        let viewport = serde_json::to_string(&self.viewport)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        settings::set(conn, KEY_VIEWPORT, &viewport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_in_memory;

    #[test]
    fn test_defaults_when_empty() {
        let conn = open_in_memory().unwrap();
        let prefs = Preferences::load(&conn).unwrap();
        assert_eq!(prefs.shell_path, None);
        assert_eq!(prefs.viewport, Viewport { cols: 120, rows: 40 });
    }

    #[test]
    fn test_save_then_load() {
        let conn = open_in_memory().unwrap();
        let prefs = Preferences {
            shell_path: Some("/usr/bin/fish".to_string()),
            viewport: Viewport { cols: 200, rows: 50 },
        };
        prefs.save(&conn).unwrap();

        assert_eq!(Preferences::load(&conn).unwrap(), prefs);
        assert_eq!(
            settings::get(&conn, KEY_VIEWPORT).unwrap().as_deref(),
            Some(r#"{"cols":200,"rows":50}"#)
        );
    }

    #[test]
    fn test_clearing_shell_path_removes_key() {
        let conn = open_in_memory().unwrap();
        settings::set(&conn, KEY_SHELL_PATH, "/bin/zsh").unwrap();

        Preferences::default().save(&conn).unwrap();
        assert_eq!(settings::get(&conn, KEY_SHELL_PATH).unwrap(), None);
    }

    #[test]
    fn test_bad_viewport_falls_back() {
        let conn = open_in_memory().unwrap();
        settings::set(&conn, KEY_SHELL_PATH, "/bin/bash").unwrap();

        settings::set(&conn, KEY_VIEWPORT, "not json").unwrap();
        let prefs = Preferences::load(&conn).unwrap();
        assert_eq!(prefs.viewport, Viewport::default());
        assert_eq!(prefs.shell_path.as_deref(), Some("/bin/bash"));

        settings::set(&conn, KEY_VIEWPORT, r#"{"cols":0,"rows":10}"#).unwrap();
        assert_eq!(Preferences::load(&conn).unwrap().viewport, Viewport::default());
    }

    #[test]
    fn test_blank_shell_path_ignored() {
        let conn = open_in_memory().unwrap();
        settings::set(&conn, KEY_SHELL_PATH, "  ").unwrap();
        assert_eq!(Preferences::load(&conn).unwrap().shell_path, None);
    }
}
