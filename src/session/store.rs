// ABOUTME: File-backed session records, one JSON document per session plus an archived subdirectory
// Writes go through a temp file and an atomic rename so a crash never leaves a half-written record

use super::SessionError;
use crate::models::SessionState;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const ARCHIVE_DIR: &str = "archived";

/// Reject names that would escape the sessions directory.
pub fn validate_session_name(name: &str) -> Result<(), SessionError> {
    if name.trim().is_empty() {
        return Err(SessionError::InvalidName("session name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(SessionError::InvalidName(format!(
            "invalid session name '{}': path traversal characters detected",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    archived_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let sessions_dir = sessions_dir.into();
        let archived_dir = sessions_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&sessions_dir)?;
        fs::create_dir_all(&archived_dir)?;

        Ok(Self {
            sessions_dir,
            archived_dir,
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn archived_dir(&self) -> &Path {
        &self.archived_dir
    }

    pub fn session_path(&self, name: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", name))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.log", name))
    }

    fn archived_session_path(&self, name: &str) -> PathBuf {
        self.archived_dir.join(format!("{}.json", name))
    }

    fn archived_log_path(&self, name: &str) -> PathBuf {
        self.archived_dir.join(format!("{}.log", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.session_path(name).exists()
    }

    pub fn archived_exists(&self, name: &str) -> bool {
        self.archived_session_path(name).exists()
    }

    /// Write the record to a sibling temp file, flush it to disk and rename it
    /// over the previous version.
    pub fn save(&self, session: &SessionState) -> Result<(), SessionError> {
        validate_session_name(&session.name)?;
        let json = serde_json::to_vec_pretty(session)?;

        let mut tmp = NamedTempFile::new_in(&self.sessions_dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.session_path(&session.name))
            .map_err(|e| SessionError::Io(e.error))?;

        debug!("Saved session {} ({})", session.name, session.status);
        Ok(())
    }

    /// Missing and unreadable records both surface as `NotFound`.
    pub fn load(&self, name: &str) -> Result<SessionState, SessionError> {
        validate_session_name(name)?;
        read_record(&self.session_path(name), name)
    }

    pub fn load_archived(&self, name: &str) -> Result<SessionState, SessionError> {
        validate_session_name(name)?;
        read_record(&self.archived_session_path(name), name)
    }

    /// All readable records in the active directory, sorted by name.
    pub fn list(&self) -> Result<Vec<SessionState>, SessionError> {
        list_records(&self.sessions_dir)
    }

    pub fn list_archived(&self) -> Result<Vec<SessionState>, SessionError> {
        list_records(&self.archived_dir)
    }

    /// Remove the record and its log; files that are already gone are fine.
    pub fn delete(&self, name: &str, log_file: &Path) -> Result<(), SessionError> {
        validate_session_name(name)?;
        remove_if_exists(&self.session_path(name))?;
        remove_if_exists(log_file)?;
        Ok(())
    }

    pub fn archive(&self, name: &str) -> Result<(), SessionError> {
        validate_session_name(name)?;
        if self.archived_exists(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        move_pair(
            (&self.session_path(name), &self.archived_session_path(name)),
            (&self.log_path(name), &self.archived_log_path(name)),
        )
    }

    pub fn unarchive(&self, name: &str) -> Result<(), SessionError> {
        validate_session_name(name)?;
        if !self.archived_exists(name) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        if self.exists(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        move_pair(
            (&self.archived_session_path(name), &self.session_path(name)),
            (&self.archived_log_path(name), &self.log_path(name)),
        )
    }

    /// Move the record and log of `old` to `new` in the active directory.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), SessionError> {
        validate_session_name(old)?;
        validate_session_name(new)?;
        if self.exists(new) {
            return Err(SessionError::AlreadyExists(new.to_string()));
        }
        move_pair(
            (&self.session_path(old), &self.session_path(new)),
            (&self.log_path(old), &self.log_path(new)),
        )
    }
}

fn read_record(path: &Path, name: &str) -> Result<SessionState, SessionError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SessionError::NotFound(name.to_string()))
        }
        Err(e) => return Err(SessionError::Io(e)),
    };

    serde_json::from_str(&content).map_err(|e| {
        warn!("Session file {:?} is unreadable: {}", path, e);
        SessionError::NotFound(name.to_string())
    })
}

fn list_records(dir: &Path) -> Result<Vec<SessionState>, SessionError> {
    let mut sessions = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<SessionState>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Failed to parse session file {:?}: {}", path, e),
            },
            Err(e) => warn!("Failed to read session file {:?}: {}", path, e),
        }
    }

    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sessions)
}

fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::Io(e)),
    }
}

/// Move a record and then its log. The log is optional; if moving it fails
/// the record move is rolled back.
fn move_pair(record: (&Path, &Path), log: (&Path, &Path)) -> Result<(), SessionError> {
    let (record_from, record_to) = record;
    let (log_from, log_to) = log;

    fs::rename(record_from, record_to).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            SessionError::NotFound(
                record_from
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
            )
        } else {
            SessionError::Io(e)
        }
    })?;

    if log_from.exists() {
        if let Err(e) = fs::rename(log_from, log_to) {
            if let Err(rollback) = fs::rename(record_to, record_from) {
                warn!("Failed to roll back move of {:?}: {}", record_to, rollback);
            }
            return Err(SessionError::Io(e));
        }
    }

    Ok(())
}
