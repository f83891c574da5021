//! In-memory host simulation for tests.
//!
//! [`ScriptedBackend`] keeps a virtual filesystem, a simulated dpkg package
//! database, and a list of scripted command responses. Every call is recorded
//! so tests can assert on exactly what reached the host layer. Clones share
//! state, so a test can keep a handle while the executor owns another.

use crate::backend::{Backend, Intent};
use crate::error::{Error, Result};
use crate::types::{CommandOutput, CommandSpec, FileKind, FileStat};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// One call that reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// A command was executed
    Execute {
        /// Command line
        command: String,
        /// Query or mutation
        intent: Intent,
    },
    /// A file was written
    Write(PathBuf),
    /// A file was removed
    Remove(PathBuf),
    /// A directory was created
    CreateDir(PathBuf),
    /// A path was renamed
    Rename(PathBuf, PathBuf),
    /// A symlink was created (link, target)
    Symlink(PathBuf, PathBuf),
}

impl Call {
    /// Whether this call changed (simulated) host state.
    pub fn is_mutation(&self) -> bool {
        match self {
            Self::Execute { intent, .. } => *intent == Intent::Mutate,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<PathBuf, String>,
    modes: BTreeMap<PathBuf, u32>,
    links: BTreeMap<PathBuf, PathBuf>,
    dirs: BTreeSet<PathBuf>,
    packages: BTreeSet<String>,
    rules: Vec<(String, CommandOutput)>,
    missing_programs: BTreeSet<String>,
    calls: Vec<Call>,
}

impl State {
    /// Every path with content, whether file, link or explicit directory.
    fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files
            .keys()
            .chain(self.links.keys())
            .chain(self.dirs.iter())
    }

    /// Directories exist explicitly or as the parent of anything stored.
    fn has_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.paths().any(|p| p != path && p.starts_with(path))
    }
}

/// Simulated host backend.
#[derive(Debug, Default, Clone)]
pub struct ScriptedBackend {
    state: Rc<RefCell<State>>,
}

impl ScriptedBackend {
    /// Create an empty simulated host where every command succeeds silently.
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any command line starting with `prefix`.
    ///
    /// Later rules take priority over earlier ones.
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.state
            .borrow_mut()
            .rules
            .push((prefix.to_string(), output));
        self
    }

    /// Make a program behave as if it is not installed.
    pub fn without_program(&self, program: &str) -> &Self {
        self.state
            .borrow_mut()
            .missing_programs
            .insert(program.to_string());
        self
    }

    /// Seed a file in the virtual filesystem.
    pub fn with_file(&self, path: impl AsRef<Path>, content: &str) -> &Self {
        self.state
            .borrow_mut()
            .files
            .insert(path.as_ref().to_path_buf(), content.to_string());
        self
    }

    /// Seed a symlink in the virtual filesystem.
    pub fn with_symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) -> &Self {
        self.state
            .borrow_mut()
            .links
            .insert(link.as_ref().to_path_buf(), target.as_ref().to_path_buf());
        self
    }

    /// Mark packages as installed in the simulated dpkg database.
    pub fn with_packages(&self, packages: &[&str]) -> &Self {
        self.state
            .borrow_mut()
            .packages
            .extend(packages.iter().map(|p| (*p).to_string()));
        self
    }

    /// Current content of a virtual file.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.borrow().files.get(path.as_ref()).cloned()
    }

    /// Target of a virtual symlink.
    pub fn link(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
        self.state.borrow().links.get(path.as_ref()).cloned()
    }

    /// Whether a package is installed in the simulated database.
    pub fn has_package(&self, name: &str) -> bool {
        self.state.borrow().packages.contains(name)
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Only the calls that changed host state.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    /// Command lines executed, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Execute { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls (state is kept).
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Simulate dpkg/apt commands against the package database.
    fn simulate_packages(state: &mut State, spec: &CommandSpec) -> Option<CommandOutput> {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match spec.program.as_str() {
            "dpkg-query" if args.first() == Some(&"-W") => {
                let name = args.last()?;
                if state.packages.contains(*name) {
                    Some(CommandOutput::ok("install ok installed"))
                } else {
                    Some(CommandOutput::failed(
                        1,
                        format!("dpkg-query: no packages found matching {name}"),
                    ))
                }
            }
            "dpkg" if args.first() == Some(&"--get-selections") => {
                let listing: String = state
                    .packages
                    .iter()
                    .map(|p| format!("{p}\t\t\t\t\tinstall\n"))
                    .collect();
                Some(CommandOutput::ok(listing))
            }
            "apt-get" => {
                let verb = args.iter().find(|a| !a.starts_with('-'))?;
                let names = args
                    .iter()
                    .skip_while(|a| *a != verb)
                    .skip(1)
                    .filter(|a| !a.starts_with('-'));
                match *verb {
                    "install" => {
                        for name in names {
                            state.packages.insert((*name).to_string());
                        }
                        Some(CommandOutput::ok(""))
                    }
                    "purge" | "remove" => {
                        for name in names {
                            state.packages.remove(*name);
                        }
                        Some(CommandOutput::ok(""))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl Backend for ScriptedBackend {
    fn execute(
        &self,
        spec: &CommandSpec,
        intent: Intent,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let command = spec.display();
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Execute {
            command: command.clone(),
            intent,
        });

        if state.missing_programs.contains(&spec.program) {
            return Err(Error::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        if let Some((_, output)) = state
            .rules
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Ok(output.clone());
        }

        Ok(Self::simulate_packages(&mut state, spec).unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state.borrow().files.get(path).cloned())
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .borrow()
            .files
            .get(path)
            .map(|content| content.clone().into_bytes()))
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>> {
        let state = self.state.borrow();
        let stat = if state.links.contains_key(path) {
            Some(FileStat {
                kind: FileKind::Symlink,
                mode: 0o777,
            })
        } else if state.files.contains_key(path) {
            Some(FileStat {
                kind: FileKind::File,
                mode: state.modes.get(path).copied().unwrap_or(0o644),
            })
        } else if state.has_dir(path) {
            Some(FileStat {
                kind: FileKind::Dir,
                mode: 0o755,
            })
        } else {
            None
        };
        Ok(stat)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state.borrow();
        if !state.has_dir(path) {
            return Err(Error::File {
                action: "list",
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let children: BTreeSet<PathBuf> = state
            .paths()
            .filter_map(|p| {
                let first = p.strip_prefix(path).ok()?.components().next()?;
                Some(path.join(first))
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.state
            .borrow()
            .links
            .get(path)
            .cloned()
            .ok_or_else(|| Error::File {
                action: "read link",
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            })
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.borrow();
        state.files.contains_key(path) || state.links.contains_key(path) || state.has_dir(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Write(path.to_path_buf()));
        state.links.remove(path);
        state.files.insert(
            path.to_path_buf(),
            String::from_utf8_lossy(contents).into_owned(),
        );
        if let Some(mode) = mode {
            state.modes.insert(path.to_path_buf(), mode);
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Remove(path.to_path_buf()));
        state.files.remove(path);
        state.links.remove(path);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::CreateDir(path.to_path_buf()));
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .calls
            .push(Call::Rename(from.to_path_buf(), to.to_path_buf()));
        if let Some(content) = state.files.remove(from) {
            state.files.insert(to.to_path_buf(), content);
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .calls
            .push(Call::Symlink(link.to_path_buf(), target.to_path_buf()));
        state.files.remove(link);
        state.links.insert(link.to_path_buf(), target.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_latest_wins() {
        let backend = ScriptedBackend::new();
        backend
            .on("systemctl is-active docker", CommandOutput::failed(3, ""))
            .on("systemctl is-active docker", CommandOutput::ok("active"));
        let spec = CommandSpec::new("systemctl").args(["is-active", "docker"]);
        let out = backend.execute(&spec, Intent::Query, None).unwrap();
        assert_eq!(out.stdout, "active");
    }

    #[test]
    fn test_package_simulation() {
        let backend = ScriptedBackend::new();
        let query = CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}", "jq"]);
        assert!(!backend.execute(&query, Intent::Query, None).unwrap().success());

        let install = CommandSpec::new("apt-get").args(["install", "-y", "jq", "curl"]);
        backend.execute(&install, Intent::Mutate, None).unwrap();
        assert!(backend.has_package("jq"));
        assert!(backend.has_package("curl"));
        assert!(backend.execute(&query, Intent::Query, None).unwrap().success());

        let purge = CommandSpec::new("apt-get").args(["purge", "-y", "jq"]);
        backend.execute(&purge, Intent::Mutate, None).unwrap();
        assert!(!backend.has_package("jq"));
    }

    #[test]
    fn test_missing_program() {
        let backend = ScriptedBackend::new();
        backend.without_program("lspci");
        let err = backend
            .execute(&CommandSpec::new("lspci"), Intent::Query, None)
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_directories_follow_stored_paths() {
        let backend = ScriptedBackend::new();
        backend
            .with_file("/etc/netplan/01-netcfg.yaml", "network: {}\n")
            .with_file("/etc/netplan/sub/02.yaml", "")
            .with_symlink("/etc/resolv.conf", "../run/systemd/resolve/stub-resolv.conf");

        let kind = |p: &str| backend.stat(Path::new(p)).unwrap().map(|s| s.kind);
        assert_eq!(kind("/etc/netplan"), Some(FileKind::Dir));
        assert_eq!(kind("/etc/netplan/01-netcfg.yaml"), Some(FileKind::File));
        assert_eq!(kind("/etc/resolv.conf"), Some(FileKind::Symlink));
        assert_eq!(kind("/etc/missing"), None);

        assert_eq!(
            backend.list_dir(Path::new("/etc/netplan")).unwrap(),
            vec![
                PathBuf::from("/etc/netplan/01-netcfg.yaml"),
                PathBuf::from("/etc/netplan/sub"),
            ]
        );
        assert!(backend.list_dir(Path::new("/srv")).is_err());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_mutations_exclude_queries() {
        let backend = ScriptedBackend::new();
        backend
            .execute(&CommandSpec::new("uname"), Intent::Query, None)
            .unwrap();
        backend.write_file(Path::new("/etc/x"), b"1", None).unwrap();
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(backend.mutations(), vec![Call::Write(PathBuf::from("/etc/x"))]);
    }
}
