//! Real host backend using `std::process` and `std::fs`.

use crate::backend::{Backend, Intent};
use crate::error::{Error, Result};
use crate::types::{CommandOutput, CommandSpec, FileKind, FileStat};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between `try_wait` polls while a command runs.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for output pipes to drain after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Backend that runs real commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl SystemBackend {
    /// Create a new system backend.
    pub fn new() -> Self {
        Self
    }
}

/// A thread draining one output pipe.
struct Reader {
    rx: mpsc::Receiver<String>,
    handle: thread::JoinHandle<()>,
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Reader {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    Reader { rx, handle }
}

fn collect(reader: Option<Reader>, timed_out: bool) -> String {
    let Some(Reader { rx, handle }) = reader else {
        return String::new();
    };
    // A process that left the group can still hold the pipe open
    let received = if timed_out {
        rx.recv_timeout(DRAIN_GRACE).ok()
    } else {
        rx.recv().ok()
    };
    match received {
        Some(text) => {
            let _ = handle.join();
            text
        }
        None => {
            log::debug!("Output pipe still open after kill, detaching its reader");
            String::new()
        }
    }
}

/// Kill the child and everything it started.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) takes plain integers; -pid names the group created at spawn
        if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            return;
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn file_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Error + 'a {
    move |source| Error::File {
        action,
        path: path.to_path_buf(),
        source,
    }
}

impl Backend for SystemBackend {
    fn execute(
        &self,
        spec: &CommandSpec,
        intent: Intent,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        log::debug!("exec[{intent}] {spec}");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|source| Error::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if let Some(limit) = timeout
                        && start.elapsed() >= limit
                    {
                        log::warn!("'{spec}' exceeded {}s timeout, killing", limit.as_secs());
                        kill_group(&mut child);
                        let _ = child.wait();
                        timed_out = true;
                        break None;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(Error::Spawn {
                        program: spec.program.clone(),
                        source,
                    });
                }
            }
        };

        let output = CommandOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout: collect(stdout_reader, timed_out),
            stderr: collect(stderr_reader, timed_out),
            timed_out,
        };
        log::trace!(
            "exit={:?} stdout={} bytes stderr={} bytes",
            output.exit_code,
            output.stdout.len(),
            output.stderr.len()
        );
        Ok(output)
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(file_err("read", path)(e)),
        }
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(file_err("read", path)(e)),
        }
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(file_err("stat", path)(e)),
        };
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else {
            FileKind::File
        };
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o777
        };
        #[cfg(not(unix))]
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        Ok(Some(FileStat { kind, mode }))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)
            .map_err(file_err("list", path))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(file_err("list", path))?;
        entries.sort();
        Ok(entries)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).map_err(file_err("read link", path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(file_err("create directory for", path))?;
        }

        // Write to a sibling temp file and rename so readers never see a partial file
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.gpuhost-tmp"));
        {
            let mut file = fs::File::create(&tmp).map_err(file_err("write", &tmp))?;
            file.write_all(contents).map_err(file_err("write", &tmp))?;
            file.sync_all().map_err(file_err("sync", &tmp))?;
        }

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
                .map_err(file_err("chmod", &tmp))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        fs::rename(&tmp, path).map_err(file_err("replace", path))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(file_err("remove", path)(e)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(file_err("create directory", path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(file_err("rename", from))
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(file_err("create directory for", link))?;
        }
        if fs::symlink_metadata(link).is_ok() {
            fs::remove_file(link).map_err(file_err("replace", link))?;
        }
        std::os::unix::fs::symlink(target, link).map_err(file_err("link", link))
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, link: &Path) -> Result<()> {
        Err(file_err("link", link)(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks need a unix host",
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_execute_captures_output_and_exit_code() {
        let backend = SystemBackend::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = backend.execute(&spec, Intent::Query, None).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout_trimmed(), "out");
        assert_eq!(out.stderr_trimmed(), "err");
        assert!(!out.timed_out);
    }

    #[test]
    fn test_execute_times_out() {
        let backend = SystemBackend::new();
        let spec = CommandSpec::new("sleep").arg("5");
        let start = Instant::now();
        let out = backend
            .execute(&spec, Intent::Mutate, Some(Duration::from_millis(200)))
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_kills_background_children() {
        let backend = SystemBackend::new();
        let spec = CommandSpec::new("sh").args(["-c", "sleep 30 & sleep 30"]);
        let start = Instant::now();
        let out = backend
            .execute(&spec, Intent::Mutate, Some(Duration::from_millis(200)))
            .unwrap();
        assert!(out.timed_out);
        // The backgrounded sleep holds stdout; without the group kill this waits out DRAIN_GRACE
        assert!(start.elapsed() < DRAIN_GRACE);
    }

    #[test]
    fn test_execute_missing_program_is_spawn_error() {
        let backend = SystemBackend::new();
        let spec = CommandSpec::new("gpuhost-definitely-not-a-program");
        let err = backend.execute(&spec, Intent::Query, None).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_write_file_creates_parents_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/script.sh");
        let backend = SystemBackend::new();
        backend
            .write_file(&path, b"#!/bin/sh\n", Some(0o755))
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        assert_eq!(backend.read_to_string(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_stat_list_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SystemBackend::new();
        backend
            .write_file(&dir.path().join("b.conf"), b"b", Some(0o600))
            .unwrap();
        backend
            .symlink(Path::new("b.conf"), &dir.path().join("a.conf"))
            .unwrap();
        // replacing an existing link is allowed
        backend
            .symlink(Path::new("../b.conf"), &dir.path().join("a.conf"))
            .unwrap();

        let listed = backend.list_dir(dir.path()).unwrap();
        assert_eq!(listed, vec![dir.path().join("a.conf"), dir.path().join("b.conf")]);

        let link = backend.stat(&listed[0]).unwrap().unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(backend.read_link(&listed[0]).unwrap(), PathBuf::from("../b.conf"));

        let file = backend.stat(&listed[1]).unwrap().unwrap();
        assert_eq!(file, FileStat { kind: FileKind::File, mode: 0o600 });
        assert_eq!(backend.read(&listed[1]).unwrap(), Some(b"b".to_vec()));
        assert_eq!(backend.stat(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SystemBackend::new();
        backend.remove_file(&dir.path().join("missing")).unwrap();
    }
}
