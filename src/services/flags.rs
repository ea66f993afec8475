use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::errors::SessionError;
use crate::domain::types::Skill;

/// Remembers which exams already went through the one-time device check.
pub trait FlagStore: Send + Sync {
    fn is_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<bool, SessionError>;
    fn mark_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<(), SessionError>;
}

fn flag_key(exam_id: &str, skill: Option<Skill>) -> String {
    format!("{exam_id}:{}", skill.map(Skill::as_str).unwrap_or("full"))
}

/// Flags persisted as a JSON object of `"exam:skill" -> true`.
#[derive(Debug)]
pub struct FileFlagStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileFlagStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_flags(&self) -> Result<BTreeMap<String, bool>, SessionError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(storage_error("read", &self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).map_err(|err| {
            tracing::warn!(error = %err, path = %self.path.display(), "Calibration flags file is corrupt");
            SessionError::Storage(format!("{} is not valid JSON: {err}", self.path.display()))
        })
    }

    fn write_flags(&self, flags: &BTreeMap<String, bool>) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| storage_error("create", parent, err))?;
        }

        let body = serde_json::to_string_pretty(flags)
            .map_err(|err| SessionError::Storage(err.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, body).map_err(|err| storage_error("write", &staging, err))?;
        fs::rename(&staging, &self.path).map_err(|err| storage_error("replace", &self.path, err))
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> SessionError {
    tracing::warn!(error = %err, path = %path.display(), action, "Calibration flags I/O failed");
    SessionError::Storage(format!("failed to {action} {}: {err}", path.display()))
}

impl FlagStore for FileFlagStore {
    fn is_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<bool, SessionError> {
        let _guard = self.lock.lock().map_err(|_| SessionError::Storage("flag lock poisoned".into()))?;
        let flags = self.read_flags()?;
        Ok(flags.get(&flag_key(exam_id, skill)).copied().unwrap_or(false))
    }

    fn mark_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<(), SessionError> {
        let _guard = self.lock.lock().map_err(|_| SessionError::Storage("flag lock poisoned".into()))?;
        let mut flags = self.read_flags()?;
        flags.insert(flag_key(exam_id, skill), true);
        self.write_flags(&flags)?;
        tracing::info!(exam_id, skill = skill.map(Skill::as_str).unwrap_or("full"), "Calibration recorded");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    flags: Mutex<BTreeMap<String, bool>>,
}

impl FlagStore for MemoryFlagStore {
    fn is_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<bool, SessionError> {
        let flags = self.flags.lock().map_err(|_| SessionError::Storage("flag lock poisoned".into()))?;
        Ok(flags.get(&flag_key(exam_id, skill)).copied().unwrap_or(false))
    }

    fn mark_calibrated(&self, exam_id: &str, skill: Option<Skill>) -> Result<(), SessionError> {
        let mut flags =
            self.flags.lock().map_err(|_| SessionError::Storage("flag lock poisoned".into()))?;
        flags.insert(flag_key(exam_id, skill), true);
        Ok(())
    }
}
