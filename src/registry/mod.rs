// Registry module - Directory-backed table of supervised children
//
// One file per application under the state directory, holding
// `name:child_pid:supervisor_pid`. Deaf children are moved under `deaf/`,
// where the file is named after the child pid.

use crate::error::{Result, WardenError};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Sub-directory holding records of deaf children
pub const DEAF_DIR: &str = "deaf";

/// Liveness record of one supervised child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub app: String,
    pub child_pid: u32,
    pub supervisor_pid: u32,
}

impl fmt::Display for PidRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.app, self.child_pid, self.supervisor_pid)
    }
}

impl FromStr for PidRecord {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WardenError::RegistryError(format!("Invalid PID record: '{}'", s.trim()));

        let mut fields = s.trim().split(':');
        let app = fields.next().filter(|a| !a.is_empty()).ok_or_else(invalid)?;
        let child_pid = fields
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        // Records written before the supervisor pid was tracked only carry two fields
        let supervisor_pid = match fields.next() {
            Some(p) => p.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };

        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            app: app.to_string(),
            child_pid,
            supervisor_pid,
        })
    }
}

/// Directory-backed table mapping application name to its child's liveness record
#[derive(Debug, Clone)]
pub struct PidRegistry {
    root: PathBuf,
    deaf_dir: PathBuf,
}

impl PidRegistry {
    /// Open the registry rooted at `root`, creating the directories if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let deaf_dir = root.join(DEAF_DIR);

        fs::create_dir_all(&deaf_dir).map_err(|e| {
            WardenError::RegistryError(format!(
                "Failed to create state directory {}: {}",
                deaf_dir.display(),
                e
            ))
        })?;

        Ok(Self { root, deaf_dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn deaf_path(&self, child_pid: u32) -> PathBuf {
        self.deaf_dir.join(child_pid.to_string())
    }

    /// Record a freshly spawned child
    pub fn record_start(&self, name: &str, child_pid: u32, supervisor_pid: u32) -> Result<PidRecord> {
        let record = PidRecord {
            app: name.to_string(),
            child_pid,
            supervisor_pid,
        };

        self.write_atomic(&self.record_path(name), &record)?;
        info!(app = %name, pid = child_pid, "Registry updated: child recorded as running");

        Ok(record)
    }

    /// Write through a temporary file in the same directory, then rename over the target
    fn write_atomic(&self, path: &Path, record: &PidRecord) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        fs::write(&tmp, record.to_string()).map_err(|e| {
            WardenError::RegistryError(format!("Failed to write {}: {}", tmp.display(), e))
        })?;

        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            WardenError::RegistryError(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// Read the running record of an application, without checking liveness
    pub fn read(&self, name: &str) -> Result<Option<PidRecord>> {
        read_record(&self.record_path(name))
    }

    /// Check whether an application has a live child
    ///
    /// A record whose child is gone is stale: it is deleted and the
    /// application is reported as not running. So is an unreadable record.
    pub fn is_running(&self, name: &str) -> Result<bool> {
        let record = match self.read(name) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(app = %name, "Discarding unreadable PID record: {}", e);
                self.remove(name)?;
                return Ok(false);
            }
        };

        if is_process_alive(record.child_pid) {
            return Ok(true);
        }

        info!(
            app = %name,
            pid = record.child_pid,
            "Removing stale PID record (process is gone)"
        );
        self.remove(name)?;

        Ok(false)
    }

    /// Move the running record of `name` into the deaf area
    ///
    /// The record must belong to `child_pid`. On failure the child is
    /// recorded neither as running nor as deaf, so callers must report it.
    pub fn mark_deaf(&self, name: &str, child_pid: u32) -> Result<PidRecord> {
        let relocation = |reason: String| WardenError::RelocationError {
            app: name.to_string(),
            reason,
        };

        let record = self
            .read(name)
            .map_err(|e| relocation(e.to_string()))?
            .ok_or_else(|| relocation("no running record".to_string()))?;

        if record.child_pid != child_pid {
            return Err(relocation(format!(
                "running record belongs to pid {}, not {}",
                record.child_pid, child_pid
            )));
        }

        fs::create_dir_all(&self.deaf_dir).map_err(|e| relocation(e.to_string()))?;
        fs::rename(self.record_path(name), self.deaf_path(child_pid))
            .map_err(|e| relocation(e.to_string()))?;

        info!(app = %name, pid = child_pid, "Registry updated: child moved to deaf area");

        Ok(record)
    }

    /// Delete the running record of an application (absent is fine)
    pub fn remove(&self, name: &str) -> Result<()> {
        remove_if_present(&self.record_path(name))
    }

    /// Delete the running record only if it still belongs to `child_pid`
    ///
    /// Returns whether a record was removed.
    pub fn release(&self, name: &str, child_pid: u32) -> Result<bool> {
        match self.read(name) {
            Ok(Some(record)) if record.child_pid == child_pid => {
                self.remove(name)?;
                debug!(app = %name, pid = child_pid, "Registry updated: running record released");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                warn!(app = %name, "Discarding unreadable PID record: {}", e);
                self.remove(name)?;
                Ok(true)
            }
        }
    }

    /// Delete the deaf record of a child (absent is fine)
    pub fn remove_deaf(&self, child_pid: u32) -> Result<()> {
        remove_if_present(&self.deaf_path(child_pid))
    }

    /// Snapshot of applications with a live child
    pub fn list_running(&self) -> Result<Vec<PidRecord>> {
        self.scan(&self.root)
    }

    /// Snapshot of deaf children that are still alive
    pub fn list_deaf(&self) -> Result<Vec<PidRecord>> {
        self.scan(&self.deaf_dir)
    }

    /// Read every record in `dir`, pruning the ones whose child is gone
    fn scan(&self, dir: &Path) -> Result<Vec<PidRecord>> {
        let entries = fs::read_dir(dir).map_err(|e| {
            WardenError::RegistryError(format!("Could not read directory {}: {}", dir.display(), e))
        })?;

        let mut records = Vec::new();

        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            match read_record(&path) {
                Ok(Some(record)) if is_process_alive(record.child_pid) => records.push(record),
                Ok(Some(record)) => {
                    info!(
                        app = %record.app,
                        pid = record.child_pid,
                        "Removing stale PID record (process is gone)"
                    );
                    remove_if_present(&path)?;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable PID record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.app.cmp(&b.app).then(a.child_pid.cmp(&b.child_pid)));
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<Option<PidRecord>> {
    match fs::read_to_string(path) {
        Ok(content) => content.parse().map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WardenError::RegistryError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WardenError::RegistryError(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Check if a process with the given PID is alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and out-of-range values would address a process group
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true, // exists but belongs to someone else
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn own_pid() -> u32 {
        std::process::id()
    }

    #[test]
    fn test_record_format() {
        let record = PidRecord {
            app: "shop".to_string(),
            child_pid: 42,
            supervisor_pid: 7,
        };
        assert_eq!(record.to_string(), "shop:42:7");
        assert_eq!("shop:42:7\n".parse::<PidRecord>().unwrap(), record);
    }

    #[test]
    fn test_record_accepts_two_fields() {
        let record: PidRecord = "shop:42".parse().unwrap();
        assert_eq!(record.child_pid, 42);
        assert_eq!(record.supervisor_pid, 0);
    }

    #[test]
    fn test_record_rejects_garbage() {
        for bad in ["", "shop", "shop:x", ":1:2", "shop:1:2:3", "shop:1:y"] {
            assert!(bad.parse::<PidRecord>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_record_start_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        registry.record_start("shop", own_pid(), 1).unwrap();

        let record = registry.read("shop").unwrap().unwrap();
        assert_eq!(record.child_pid, own_pid());
        assert_eq!(record.supervisor_pid, 1);
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("shop")).unwrap(),
            format!("shop:{}:1", own_pid())
        );
        // No temporary file is left behind
        assert!(!temp_dir.path().join(".shop.tmp").exists());
    }

    #[test]
    fn test_is_running_for_live_process() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        assert!(!registry.is_running("shop").unwrap());

        registry.record_start("shop", own_pid(), own_pid()).unwrap();
        assert!(registry.is_running("shop").unwrap());
    }

    #[test]
    fn test_unreadable_record_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        fs::write(temp_dir.path().join("shop"), "garbage").unwrap();

        assert!(!registry.is_running("shop").unwrap());
        assert!(!temp_dir.path().join("shop").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        registry.record_start("shop", own_pid(), 1).unwrap();
        registry.remove("shop").unwrap();
        registry.remove("shop").unwrap();
        registry.remove_deaf(12345).unwrap();

        assert!(registry.read("shop").unwrap().is_none());
    }

    #[test]
    fn test_release_only_removes_own_record() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        registry.record_start("shop", own_pid(), 1).unwrap();

        assert!(!registry.release("shop", own_pid() + 1).unwrap());
        assert!(registry.read("shop").unwrap().is_some());

        assert!(registry.release("shop", own_pid()).unwrap());
        assert!(registry.read("shop").unwrap().is_none());
    }

    #[test]
    fn test_mark_deaf_relocates_record() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        registry.record_start("shop", own_pid(), 9).unwrap();
        let moved = registry.mark_deaf("shop", own_pid()).unwrap();
        assert_eq!(moved.supervisor_pid, 9);

        assert!(registry.read("shop").unwrap().is_none());
        let deaf_file = temp_dir.path().join("deaf").join(own_pid().to_string());
        assert_eq!(
            fs::read_to_string(deaf_file).unwrap(),
            format!("shop:{}:9", own_pid())
        );

        let deaf = registry.list_deaf().unwrap();
        assert_eq!(deaf.len(), 1);
        assert_eq!(deaf[0].app, "shop");
        assert!(registry.list_running().unwrap().is_empty());
    }

    #[test]
    fn test_mark_deaf_without_record_fails() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        assert!(matches!(
            registry.mark_deaf("shop", own_pid()),
            Err(WardenError::RelocationError { .. })
        ));

        registry.record_start("shop", own_pid(), 1).unwrap();
        assert!(matches!(
            registry.mark_deaf("shop", own_pid() + 1),
            Err(WardenError::RelocationError { .. })
        ));
        // The mismatched attempt left the running record alone
        assert!(registry.read("shop").unwrap().is_some());
    }

    #[test]
    fn test_list_running_skips_hidden_files_and_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PidRegistry::open(temp_dir.path()).unwrap();

        registry.record_start("b-app", own_pid(), 1).unwrap();
        registry.record_start("a-app", own_pid(), 1).unwrap();
        fs::write(temp_dir.path().join(".c-app.tmp"), "junk").unwrap();

        let running = registry.list_running().unwrap();
        let names: Vec<_> = running.iter().map(|r| r.app.as_str()).collect();
        assert_eq!(names, vec!["a-app", "b-app"]);
    }

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
        assert!(is_process_alive(own_pid()));
    }
}
