//! Immutable container plans.
//!
//! A [`Container`] is an ordered list of [`Step`]s. Every builder method borrows
//! the container and returns a new one, so a plan can be extended in several
//! directions without any of the branches observing each other.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::{Service, ServiceOpts};
use crate::Reference;

const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// A named storage area managed by the engine that outlives a single
/// evaluation. Two volumes with the same key refer to the same storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVolume {
    key: String,
}

impl CacheVolume {
    /// Creates a reference to the cache volume stored under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        CacheVolume { key: key.into() }
    }

    /// The engine-wide key of this volume.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// How long and how often to poll for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Time between two checks
    pub interval: Duration,
    /// Give up after this long. `None` waits until the caller cancels.
    pub deadline: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            interval: DEFAULT_WAIT_INTERVAL,
            deadline: None,
        }
    }
}

/// Ownership and mode applied when a file is copied into a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpts {
    /// `user[:group]` owning the file
    pub owner: Option<String>,
    /// Unix permission bits
    pub permissions: Option<u32>,
}

/// A single instruction in a container plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Start over from an image
    From {
        /// The base image
        image: Reference,
    },
    /// Write `contents` at `path`
    NewFile {
        /// Absolute path inside the container
        path: String,
        /// File contents
        contents: String,
        /// Unix permission bits
        permissions: u32,
    },
    /// Replace the image entrypoint
    Entrypoint {
        /// The new entrypoint command line
        args: Vec<String>,
    },
    /// Clear the image entrypoint
    WithoutEntrypoint,
    /// Mount a cache volume at `path`
    MountCache {
        /// Mount point
        path: String,
        /// The volume mounted there
        volume: CacheVolume,
    },
    /// Mount an empty scratch directory at `path`
    MountTemp {
        /// Mount point
        path: String,
    },
    /// Set an environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Run a command
    Exec {
        /// The command line
        args: Vec<String>,
    },
    /// Recursively remove paths, ignoring the ones that do not exist
    RemovePaths {
        /// Paths to remove
        paths: Vec<String>,
    },
    /// Block until `path` exists
    WaitForFile {
        /// The file to wait for
        path: String,
        /// How often to look and when to give up
        wait: WaitPolicy,
    },
    /// Copy one file to another path
    CopyFile {
        /// Source path
        from: String,
        /// Destination path
        to: String,
    },
    /// Replace every match of a regular expression in a file
    Substitute {
        /// The file to edit in place
        path: String,
        /// Regular expression to look for
        pattern: String,
        /// Replacement for every match
        replacement: String,
    },
    /// Place a file produced by another plan at `path`
    WithFile {
        /// Destination path
        path: String,
        /// The file to copy in
        source: File,
        /// Ownership and mode of the copy
        #[serde(default)]
        opts: FileOpts,
    },
    /// Run subsequent commands as `name`
    User {
        /// `user[:group]` name or id
        name: String,
    },
    /// Publish a TCP port
    ExposePort {
        /// The port number
        port: u16,
    },
    /// Command an interactive terminal opens with
    DefaultTerminalCmd {
        /// The command line
        args: Vec<String>,
    },
}

/// A file produced by evaluating a container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct File {
    container: Container,
    path: String,
}

impl File {
    /// The container whose evaluation produces the file.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Where the file lives inside that container.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// An immutable container plan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    steps: Vec<Step>,
}

fn strings<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

impl Container {
    /// An empty plan. Most plans start with [`Container::from`].
    pub fn new() -> Self {
        Container::default()
    }

    /// The steps of this plan, in evaluation order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns a new plan with `step` appended.
    pub fn with_step(&self, step: Step) -> Container {
        let mut steps = self.steps.clone();
        steps.push(step);
        Container { steps }
    }

    /// Applies `f` to this plan. Handy for conditional steps in a builder chain.
    pub fn with<F>(&self, f: F) -> Container
    where
        F: FnOnce(&Container) -> Container,
    {
        f(self)
    }

    /// Starts from `image`.
    pub fn from(&self, image: Reference) -> Container {
        self.with_step(Step::From { image })
    }

    /// Writes a new file with the given contents and mode.
    pub fn with_new_file(
        &self,
        path: impl Into<String>,
        contents: impl Into<String>,
        permissions: u32,
    ) -> Container {
        self.with_step(Step::NewFile {
            path: path.into(),
            contents: contents.into(),
            permissions,
        })
    }

    /// Replaces the entrypoint.
    pub fn with_entrypoint<I, S>(&self, args: I) -> Container
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(Step::Entrypoint {
            args: strings(args),
        })
    }

    /// Clears the entrypoint.
    pub fn without_entrypoint(&self) -> Container {
        self.with_step(Step::WithoutEntrypoint)
    }

    /// Mounts `volume` at `path`.
    pub fn with_mounted_cache(&self, path: impl Into<String>, volume: &CacheVolume) -> Container {
        self.with_step(Step::MountCache {
            path: path.into(),
            volume: volume.clone(),
        })
    }

    /// Mounts an empty scratch directory at `path`.
    pub fn with_mounted_temp(&self, path: impl Into<String>) -> Container {
        self.with_step(Step::MountTemp { path: path.into() })
    }

    /// Sets an environment variable.
    pub fn with_env_variable(&self, name: impl Into<String>, value: impl Into<String>) -> Container {
        self.with_step(Step::Env {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Runs a command.
    pub fn with_exec<I, S>(&self, args: I) -> Container
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(Step::Exec {
            args: strings(args),
        })
    }

    /// Recursively removes `paths`.
    pub fn with_removed_paths<I, S>(&self, paths: I) -> Container
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(Step::RemovePaths {
            paths: strings(paths),
        })
    }

    /// Blocks evaluation until `path` exists.
    pub fn with_file_wait(&self, path: impl Into<String>, wait: WaitPolicy) -> Container {
        self.with_step(Step::WaitForFile {
            path: path.into(),
            wait,
        })
    }

    /// Copies `from` to `to`.
    pub fn with_copied_file(&self, from: impl Into<String>, to: impl Into<String>) -> Container {
        self.with_step(Step::CopyFile {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Replaces every match of `pattern` in the file at `path`.
    pub fn with_substitution(
        &self,
        path: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Container {
        self.with_step(Step::Substitute {
            path: path.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
        })
    }

    /// Places `source` at `path`.
    pub fn with_file(&self, path: impl Into<String>, source: &File, opts: FileOpts) -> Container {
        self.with_step(Step::WithFile {
            path: path.into(),
            source: source.clone(),
            opts,
        })
    }

    /// Runs subsequent commands as `name`.
    pub fn with_user(&self, name: impl Into<String>) -> Container {
        self.with_step(Step::User { name: name.into() })
    }

    /// Publishes `port`.
    pub fn with_exposed_port(&self, port: u16) -> Container {
        self.with_step(Step::ExposePort { port })
    }

    /// Sets the command an interactive terminal starts with.
    pub fn with_default_terminal_cmd<I, S>(&self, args: I) -> Container
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(Step::DefaultTerminalCmd {
            args: strings(args),
        })
    }

    /// A file that evaluating this plan leaves at `path`.
    pub fn file(&self, path: impl Into<String>) -> File {
        File {
            container: self.clone(),
            path: path.into(),
        }
    }

    /// Describes a long running process started from this plan.
    pub fn as_service(&self, opts: ServiceOpts) -> Service {
        Service::new(self.clone(), opts)
    }

    /// The image selected by the last `From` step.
    pub fn image(&self) -> Option<&Reference> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::From { image } => Some(image),
            _ => None,
        })
    }

    /// The effective entrypoint, if any.
    pub fn entrypoint(&self) -> Option<&[String]> {
        self.steps
            .iter()
            .rev()
            .find_map(|s| match s {
                Step::Entrypoint { args } => Some(Some(args.as_slice())),
                Step::WithoutEntrypoint | Step::From { .. } => Some(None),
                _ => None,
            })
            .flatten()
    }

    /// Environment after all `Env` steps since the last `From`.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for step in self.since_from() {
            if let Step::Env { name, value } = step {
                env.insert(name.clone(), value.clone());
            }
        }
        env
    }

    /// The user set by the last `User` step since the last `From`.
    pub fn user(&self) -> Option<&str> {
        self.since_from().iter().rev().find_map(|s| match s {
            Step::User { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Published ports, in the order they were exposed.
    pub fn exposed_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for step in self.since_from() {
            if let Step::ExposePort { port } = step {
                if !ports.contains(port) {
                    ports.push(*port);
                }
            }
        }
        ports
    }

    /// Cache volumes mounted since the last `From`, keyed by mount path.
    pub fn cache_mounts(&self) -> BTreeMap<String, CacheVolume> {
        let mut mounts = BTreeMap::new();
        for step in self.since_from() {
            match step {
                Step::MountCache { path, volume } => {
                    mounts.insert(path.clone(), volume.clone());
                }
                Step::MountTemp { path } => {
                    mounts.remove(path);
                }
                _ => {}
            }
        }
        mounts
    }

    /// The command run by the last `Exec` step.
    pub fn last_exec(&self) -> Option<&[String]> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::Exec { args } => Some(args.as_slice()),
            _ => None,
        })
    }

    fn since_from(&self) -> &[Step] {
        let start = self
            .steps
            .iter()
            .rposition(|s| matches!(s, Step::From { .. }))
            .unwrap_or(0);
        &self.steps[start..]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn alpine() -> Container {
        Container::new().from("alpine".parse().unwrap())
    }

    #[test]
    fn builders_do_not_mutate_the_receiver() {
        let base = alpine();
        let a = base.with_env_variable("A", "1");
        let b = base.with_env_variable("B", "2");

        assert_eq!(base.steps().len(), 1);
        assert_eq!(a.env().get("A").map(String::as_str), Some("1"));
        assert!(a.env().get("B").is_none());
        assert!(b.env().get("A").is_none());
    }

    #[test]
    fn later_env_overrides_earlier() {
        let c = alpine()
            .with_env_variable("CACHE", "one")
            .with_env_variable("CACHE", "two");
        assert_eq!(c.env().get("CACHE").map(String::as_str), Some("two"));
    }

    #[test]
    fn entrypoint_is_cleared() {
        let c = alpine().with_entrypoint(vec!["entrypoint.sh"]);
        assert_eq!(c.entrypoint(), Some(&["entrypoint.sh".to_string()][..]));
        assert_eq!(c.without_entrypoint().entrypoint(), None);
    }

    #[test]
    fn last_exec_is_the_final_command() {
        assert_eq!(alpine().last_exec(), None);
        let c = alpine()
            .with_exec(vec!["apk", "add", "curl"])
            .with_user("1001")
            .with_exec(vec!["sh", "-c", "kubectl version"]);
        assert_eq!(
            c.last_exec(),
            Some(&["sh".to_string(), "-c".to_string(), "kubectl version".to_string()][..])
        );
    }

    #[test]
    fn from_resets_derived_state() {
        let c = alpine()
            .with_user("1001")
            .with_exposed_port(6443)
            .from("rancher/k3s".parse().unwrap());
        assert_eq!(c.user(), None);
        assert!(c.exposed_ports().is_empty());
        assert_eq!(c.image().unwrap().repository(), "rancher/k3s");
    }

    #[test]
    fn conditional_steps_with_closure() {
        let keep = false;
        let c = alpine().with(|c| {
            if keep {
                c.clone()
            } else {
                c.with_removed_paths(vec!["/var/lib/rancher/k3s/"])
            }
        });
        assert_eq!(
            c.steps().last(),
            Some(&Step::RemovePaths {
                paths: vec!["/var/lib/rancher/k3s/".to_string()]
            })
        );
    }

    #[test]
    fn cache_mounts_track_shadowing() {
        let volume = CacheVolume::new("k3s_config_demo");
        let c = alpine()
            .with_mounted_cache("/etc/rancher/k3s", &volume)
            .with_mounted_cache("/var/log", &CacheVolume::new("logs"))
            .with_mounted_temp("/var/log");
        let mounts = c.cache_mounts();
        assert_eq!(mounts.get("/etc/rancher/k3s"), Some(&volume));
        assert!(mounts.get("/var/log").is_none());
    }

    #[test]
    fn plan_serializes_with_tagged_steps() {
        let c = alpine().with_exec(vec!["echo", "hi"]);
        let yaml = serde_yaml::to_string(&c).expect("serialize");
        assert!(yaml.contains("op: exec"));
        assert!(yaml.contains("docker.io/library/alpine"));
    }
}
