//! Shells the user can switch between.

use std::path::{Path, PathBuf};

#[cfg(not(windows))]
const WELL_KNOWN_SHELLS: &[&str] = &["zsh", "bash", "fish", "sh", "dash", "ksh", "tcsh", "nu"];

#[cfg(windows)]
const WELL_KNOWN_SHELLS: &[&str] = &["pwsh", "powershell", "cmd"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellEntry {
    /// Short name shown in the shell list, e.g. `zsh`.
    pub name: String,
    pub path: String,
}

impl ShellEntry {
    fn from_path(path: &str) -> Self {
        let name = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Self {
            name,
            path: path.to_string(),
        }
    }
}

/// Ordered list of installed shells, without duplicates.
#[derive(Clone, Debug, Default)]
pub struct ShellCatalog {
    entries: Vec<ShellEntry>,
}

impl ShellCatalog {
    /// Shells listed in `/etc/shells` first, then well-known shells found on PATH.
    pub fn discover() -> Self {
        let mut paths: Vec<String> = std::fs::read_to_string("/etc/shells")
            .map(|contents| parse_etc_shells(&contents))
            .unwrap_or_default()
            .into_iter()
            .filter(|p| Path::new(p).exists())
            .collect();

        paths.extend(WELL_KNOWN_SHELLS.iter().filter_map(|name| find_in_path(name)));

        Self::from_paths(paths)
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut catalog = Self::default();
        for path in paths {
            let path = path.as_ref().trim();
            if path.is_empty() || catalog.entries.iter().any(|e| e.path == path) {
                continue;
            }
            catalog.entries.push(ShellEntry::from_path(path));
        }
        catalog
    }

    pub fn get(&self, index: usize) -> Option<&ShellEntry> {
        self.entries.get(index)
    }

    /// Look a shell up by short name or full path.
    pub fn find(&self, name: &str) -> Option<&ShellEntry> {
        self.entries
            .iter()
            .find(|e| e.path == name)
            .or_else(|| self.entries.iter().find(|e| e.name == name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShellEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Paths listed in an `/etc/shells` file.
pub fn parse_etc_shells(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn find_in_path(program: &str) -> Option<String> {
    which::which(program)
        .ok()
        .map(|p: PathBuf| p.to_string_lossy().to_string())
}

/// The shell to start when nothing else was asked for.
///
/// `$SHELL` if set, otherwise the first well-known shell on PATH.
pub fn default_shell() -> Option<String> {
    #[cfg(not(windows))]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.trim().is_empty() {
                return Some(shell);
            }
        }
    }

    #[cfg(not(windows))]
    let preferred = ["zsh", "bash", "sh"];
    #[cfg(windows)]
    let preferred = ["pwsh", "powershell", "cmd"];

    preferred.iter().find_map(|name| find_in_path(name))
}
