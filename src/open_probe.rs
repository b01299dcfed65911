use std::path::Path;

/// Tells whether another process still holds a file open.
pub trait OpenFileProbe: Send + Sync {
    fn is_open(&self, path: &Path) -> bool;
}

/// Assumes every file is closed. Used where no probe is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl OpenFileProbe for NoProbe {
    fn is_open(&self, _path: &Path) -> bool {
        false
    }
}

/// Counts handles on a file by walking `/proc/<pid>/fd`.
///
/// The engine holds no handle on a source file while probing, so any
/// handle found belongs to the writer. Processes whose descriptor table
/// cannot be read are skipped.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFdProbe;

#[cfg(target_os = "linux")]
impl ProcFdProbe {
    pub fn open_handles(&self, path: &Path) -> usize {
        let Ok(target) = std::fs::canonicalize(path) else {
            return 0;
        };
        let Ok(procs) = std::fs::read_dir("/proc") else {
            return 0;
        };

        let mut count = 0;
        for proc_entry in procs.flatten() {
            let name = proc_entry.file_name();
            if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(fds) = std::fs::read_dir(proc_entry.path().join("fd")) else {
                continue;
            };
            count += fds
                .flatten()
                .filter_map(|fd| std::fs::read_link(fd.path()).ok())
                .filter(|link| *link == target)
                .count();
        }
        count
    }
}

#[cfg(target_os = "linux")]
impl OpenFileProbe for ProcFdProbe {
    fn is_open(&self, path: &Path) -> bool {
        self.open_handles(path) > 0
    }
}

/// Asks `lsof -t` for the pids holding a file.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofProbe;

#[cfg(unix)]
impl OpenFileProbe for LsofProbe {
    fn is_open(&self, path: &Path) -> bool {
        match std::process::Command::new("lsof").arg("-t").arg(path).output() {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| !line.trim().is_empty()),
            Err(e) => {
                tracing::debug!(error = %e, "lsof unavailable, treating file as closed");
                false
            }
        }
    }
}

/// Best probe for the current platform.
pub fn platform_probe() -> Box<dyn OpenFileProbe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcFdProbe)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Box::new(LsofProbe)
    }
    #[cfg(not(unix))]
    {
        tracing::info!("open-file check unavailable on this platform, files are assumed closed");
        Box::new(NoProbe)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs::{self, File};

    #[test]
    fn test_proc_probe_sees_held_handle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reads_0001.fastq.gz");
        fs::write(&path, b"@r\nACGT\n+\nIIII\n").unwrap();

        assert!(!ProcFdProbe.is_open(&path));

        let handle = File::open(&path).unwrap();
        assert!(ProcFdProbe.is_open(&path));
        assert!(ProcFdProbe.open_handles(&path) >= 1);

        drop(handle);
        assert!(!ProcFdProbe.is_open(&path));
    }

    #[test]
    fn test_proc_probe_missing_file_is_closed() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(!ProcFdProbe.is_open(&temp_dir.path().join("missing.fastq")));
    }

    #[test]
    fn test_no_probe_never_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.fastq");
        fs::write(&path, b"x").unwrap();
        let _handle = File::open(&path).unwrap();
        assert!(!NoProbe.is_open(&path));
    }
}
