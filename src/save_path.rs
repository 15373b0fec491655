//! Mapping a game's save folder template to a directory on disk.

use crate::error::{ChunkSyncError, Result};
use crate::types::{Credentials, SaveGame};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Finds the local save directory of a game.
pub trait SaveDirResolver: Send + Sync {
    fn resolve(&self, game: &SaveGame, credentials: &Credentials) -> Result<PathBuf>;
}

/// Always the same directory, whatever the game.
#[derive(Debug, Clone)]
pub struct FixedSaveDir(pub PathBuf);

impl SaveDirResolver for FixedSaveDir {
    fn resolve(&self, _game: &SaveGame, _credentials: &Credentials) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Expands `{appdata}`-style placeholders against a Windows-layout prefix
/// (`{prefix}/drive_c/users/{user}/...`).
///
/// Placeholders match case-insensitively. Backslashes become slashes and `.`/`..`
/// segments are folded without touching the filesystem.
#[derive(Debug, Clone)]
pub struct TemplateSaveDirResolver {
    prefix: PathBuf,
    user: String,
    install_root: Option<PathBuf>,
}

impl TemplateSaveDirResolver {
    pub fn new(prefix: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            user: user.into(),
            install_root: None,
        }
    }

    /// Directory whose `{app_name}` child stands in for `{installdir}` when a game
    /// carries no install directory of its own.
    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = Some(root.into());
        self
    }

    fn user_dir(&self) -> PathBuf {
        self.prefix.join("drive_c").join("users").join(&self.user)
    }

    /// Existing spelling of the AppData folder, `AppData` when none exists yet.
    fn app_data_dir(&self) -> PathBuf {
        let user_dir = self.user_dir();
        ["AppData", "appdata", "appData"]
            .iter()
            .map(|name| user_dir.join(name))
            .find(|path| path.is_dir())
            .unwrap_or_else(|| user_dir.join("AppData"))
    }

    fn variables(&self, game: &SaveGame, credentials: &Credentials) -> Vec<(&'static str, String)> {
        let user_dir = self.user_dir();
        let app_data = self.app_data_dir();
        let install_dir = game
            .install_dir
            .clone()
            .or_else(|| self.install_root.as_ref().map(|root| root.join(&game.app_name)))
            .unwrap_or_default();

        vec![
            ("{epicid}", credentials.account_id.clone()),
            ("{installdir}", slash_path(&install_dir)),
            ("{appname}", game.app_name.clone()),
            ("{appdata}", slash_path(&app_data.join("Local"))),
            ("{localappdata}", slash_path(&app_data.join("Local"))),
            ("{roamingappdata}", slash_path(&app_data.join("Roaming"))),
            ("{userdir}", slash_path(&user_dir.join("Documents"))),
            ("{usersavedgames}", slash_path(&user_dir.join("Saved Games"))),
            ("{userprofile}", slash_path(&user_dir)),
        ]
    }
}

impl SaveDirResolver for TemplateSaveDirResolver {
    fn resolve(&self, game: &SaveGame, credentials: &Credentials) -> Result<PathBuf> {
        if game.save_folder.trim().is_empty() {
            return Err(ChunkSyncError::MissingData(format!(
                "{} has no cloud save folder",
                game.app_name
            )));
        }

        let mut resolved = game.save_folder.replace('\\', "/");
        for (name, value) in self.variables(game, credentials) {
            resolved = replace_ignore_case(&resolved, name, &value);
        }
        let path = normalize(&resolved);
        debug!("Save folder {:?} -> {}", game.save_folder, path.display());
        Ok(path)
    }
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Replaces every ASCII case-insensitive occurrence of `needle`.
fn replace_ignore_case(haystack: &str, needle: &str, value: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..idx]);
        out.push_str(value);
        last = idx + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// Folds `.` and `..` segments of a slash-separated path. A `..` with nothing left
/// to pop is dropped.
fn normalize(path: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if path.starts_with('/') {
        PathBuf::from(format!("/{}", joined))
    } else {
        PathBuf::from(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(save_folder: &str) -> SaveGame {
        SaveGame {
            game_id: 3,
            app_name: "Fern".to_string(),
            save_folder: save_folder.to_string(),
            install_dir: None,
        }
    }

    fn creds() -> Credentials {
        Credentials {
            access_token: "t".to_string(),
            account_id: "acct42".to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_expands_placeholders_case_insensitively() {
        let resolver = TemplateSaveDirResolver::new("/prefix", "player");
        let path = resolver
            .resolve(&game("{AppData}\\Studio\\{EpicId}\\Saves"), &creds())
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/prefix/drive_c/users/player/AppData/Local/Studio/acct42/Saves")
        );

        let path = resolver.resolve(&game("{UserSavedGames}/Fern"), &creds()).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/prefix/drive_c/users/player/Saved Games/Fern")
        );
    }

    #[test]
    fn test_folds_dot_segments() {
        let resolver = TemplateSaveDirResolver::new("/prefix", "player");
        let path = resolver
            .resolve(&game("{userdir}/../AppData/./Roaming/x"), &creds())
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/prefix/drive_c/users/player/AppData/Roaming/x")
        );
        assert_eq!(normalize("../a/b/../c"), PathBuf::from("a/c"));
    }

    #[test]
    fn test_install_dir_fallback() {
        let resolver = TemplateSaveDirResolver::new("/prefix", "player").with_install_root("/games");
        let path = resolver.resolve(&game("{installdir}/Saved"), &creds()).unwrap();
        assert_eq!(path, PathBuf::from("/games/Fern/Saved"));

        let mut own = game("{InstallDir}/Saved");
        own.install_dir = Some(PathBuf::from("/opt/fern"));
        assert_eq!(resolver.resolve(&own, &creds()).unwrap(), PathBuf::from("/opt/fern/Saved"));
    }

    #[test]
    fn test_existing_lowercase_appdata_is_used() {
        let prefix = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(prefix.path().join("drive_c/users/player/appdata")).unwrap();
        let resolver = TemplateSaveDirResolver::new(prefix.path(), "player");
        let path = resolver.resolve(&game("{appdata}/x"), &creds()).unwrap();
        assert!(path.ends_with("drive_c/users/player/appdata/Local/x"));
    }

    #[test]
    fn test_empty_template_is_rejected() {
        let resolver = TemplateSaveDirResolver::new("/prefix", "player");
        assert!(resolver.resolve(&game(""), &creds()).is_err());
    }
}
