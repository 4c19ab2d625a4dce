//! The entrypoint shim that prepares cgroup v2 nesting before k3s starts.
//!
//! k3s only moves processes out of the root cgroup when it runs as PID 1. In
//! an engine container it does not, so enabling controllers for child groups
//! would fail with `EBUSY`. The shim does the evacuation and then `exec`s the
//! real command, leaving no supervisor process behind.
//!
//! The procedure follows moby's `hack/dind` script (Apache-2.0).
//!
//! Two renditions exist: [`script`] is written into the cluster image and
//! [`evacuate`] does the same work natively for the `shim` subcommand.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use container_spec::Container;
use tracing::{debug, info, warn};

/// Mount point of the unified cgroup hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
/// The child group the root's processes are moved into.
pub const CHILD_GROUP: &str = "init";
/// Where the script is written in the cluster image.
pub const ENTRYPOINT_PATH: &str = "/usr/bin/entrypoint.sh";
/// The entrypoint command, resolved through `PATH`.
pub const ENTRYPOINT: &str = "entrypoint.sh";

/// What happens when a shim step fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The shim stops and the container exits
    Abort,
    /// The failure is ignored and the shim carries on
    Ignore,
}

/// One command of the shim script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShimStep {
    /// Shell command line
    pub command: String,
    /// Failure handling for the command
    pub policy: FailurePolicy,
}

impl ShimStep {
    fn abort(command: String) -> Self {
        ShimStep {
            command,
            policy: FailurePolicy::Abort,
        }
    }

    fn ignore(command: String) -> Self {
        ShimStep {
            command,
            policy: FailurePolicy::Ignore,
        }
    }

    fn render(&self) -> String {
        match self.policy {
            FailurePolicy::Abort => self.command.clone(),
            FailurePolicy::Ignore => format!("{} || :", self.command),
        }
    }
}

/// The steps run when `root` holds a unified hierarchy.
pub fn steps(root: &str) -> Vec<ShimStep> {
    let child = format!("{}/{}", root, CHILD_GROUP);
    vec![
        ShimStep::abort(
            r#"echo "[$(date -Iseconds)] [CgroupV2 Fix] Evacuating Root Cgroup ...""#.to_string(),
        ),
        ShimStep::ignore(format!("mkdir -p {}", child)),
        // One write per PID; a PID that exited in between fails on its own.
        ShimStep::ignore(format!(
            "xargs -rn1 < {root}/cgroup.procs > {child}/cgroup.procs",
            root = root,
            child = child
        )),
        ShimStep::ignore(format!(
            r#"sed -e 's/ / +/g' -e 's/^/+/' < "{root}/cgroup.controllers" > "{root}/cgroup.subtree_control""#,
            root = root
        )),
        ShimStep::abort(r#"echo "[$(date -Iseconds)] [CgroupV2 Fix] Done""#.to_string()),
    ]
}

/// Renders the shim for the hierarchy mounted at `root`.
pub fn render(root: &str) -> String {
    let mut script = String::from(
        "#!/bin/sh\n\
         \n\
         set -o errexit\n\
         set -o nounset\n\
         \n\
         # cgroup v2 evacuation adapted from moby hack/dind (Apache-2.0)\n",
    );
    // A missing cgroup.controllers means cgroup v1 or no cgroupfs: nothing to do.
    script.push_str(&format!("if [ -f {}/cgroup.controllers ]; then\n", root));
    for step in steps(root) {
        script.push_str("  ");
        script.push_str(&step.render());
        script.push('\n');
    }
    script.push_str("fi\n\nexec \"$@\"\n");
    script
}

/// The shim for the standard cgroup mount.
pub fn script() -> String {
    render(CGROUP_ROOT)
}

/// Installs the shim as the entrypoint of `container`.
pub fn install(container: &Container) -> Container {
    container
        .with_new_file(ENTRYPOINT_PATH, script(), 0o755)
        .with_entrypoint(vec![ENTRYPOINT])
}

/// Outcome of [`evacuate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evacuation {
    /// `root` holds no unified hierarchy
    NotApplicable,
    /// The evacuation ran. Failures along the way are listed, not fatal.
    Evacuated {
        /// PIDs moved into the child group
        moved: Vec<u32>,
        /// Controllers enabled for child groups
        controllers: Vec<String>,
        /// Ignored failures
        warnings: Vec<String>,
    },
}

/// Moves every process out of the root group at `root` and enables all of
/// its controllers for child groups.
///
/// Nothing is returned as an error. A missing `cgroup.controllers` makes the
/// whole procedure not applicable; every other failure is logged and listed
/// in the returned warnings.
pub fn evacuate(root: impl AsRef<Path>) -> Evacuation {
    let root = root.as_ref();
    let controllers_file = root.join("cgroup.controllers");
    if !controllers_file.is_file() {
        debug!(root = %root.display(), "No unified cgroup hierarchy, skipping evacuation");
        return Evacuation::NotApplicable;
    }

    info!(root = %root.display(), "Evacuating root cgroup");
    let mut warnings = Vec::new();
    let mut note = |what: String| {
        warn!("{}", what);
        warnings.push(what);
    };

    let child = root.join(CHILD_GROUP);
    if let Err(e) = fs::create_dir_all(&child) {
        note(format!("unable to create {}: {}", child.display(), e));
    }

    let mut moved = Vec::new();
    match fs::read_to_string(root.join("cgroup.procs")) {
        Ok(procs) => {
            let pids = procs.split_whitespace().filter_map(|p| p.parse::<u32>().ok());
            for pid in pids {
                match move_pid(&child, pid) {
                    Ok(()) => moved.push(pid),
                    Err(e) => note(format!("unable to move pid {}: {}", pid, e)),
                }
            }
        }
        Err(e) => note(format!("unable to read root cgroup.procs: {}", e)),
    }

    let mut controllers = Vec::new();
    match fs::read_to_string(&controllers_file) {
        Ok(listed) => {
            controllers = listed.split_whitespace().map(str::to_string).collect();
            let enable = controllers
                .iter()
                .map(|c| format!("+{}", c))
                .collect::<Vec<_>>()
                .join(" ");
            if let Err(e) = fs::write(root.join("cgroup.subtree_control"), enable) {
                note(format!("unable to enable controllers: {}", e));
                controllers.clear();
            }
        }
        Err(e) => note(format!("unable to read cgroup.controllers: {}", e)),
    }

    info!(moved = moved.len(), ?controllers, "Root cgroup evacuated");
    Evacuation::Evacuated {
        moved,
        controllers,
        warnings,
    }
}

// cgroupfs takes exactly one PID per write.
fn move_pid(child: &Path, pid: u32) -> std::io::Result<()> {
    let mut procs = OpenOptions::new()
        .create(true)
        .append(true)
        .open(child.join("cgroup.procs"))?;
    procs.write_all(format!("{}\n", pid).as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn script_guards_on_unified_hierarchy_and_execs() {
        let script = script();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("if [ -f /sys/fs/cgroup/cgroup.controllers ]; then\n"));
        assert!(script.ends_with("exec \"$@\"\n"));
    }

    #[test]
    fn cgroup_manipulation_is_best_effort() {
        for step in steps(CGROUP_ROOT) {
            let touches_cgroupfs = step.command.contains("/sys/fs/cgroup");
            assert_eq!(
                touches_cgroupfs,
                step.policy == FailurePolicy::Ignore,
                "{}",
                step.command
            );
        }
        let script = script();
        assert!(script.contains(
            "  xargs -rn1 < /sys/fs/cgroup/cgroup.procs > /sys/fs/cgroup/init/cgroup.procs || :\n"
        ));
        assert!(script.contains("  mkdir -p /sys/fs/cgroup/init || :\n"));
    }

    #[test]
    fn install_sets_executable_entrypoint() {
        let c = install(&Container::new().from("rancher/k3s".parse().unwrap()));
        assert_eq!(c.entrypoint(), Some(&[ENTRYPOINT.to_string()][..]));
        assert!(c.steps().iter().any(|s| matches!(
            s,
            container_spec::Step::NewFile { path, permissions, .. }
                if path == ENTRYPOINT_PATH && *permissions == 0o755
        )));
    }

    #[test]
    fn evacuate_without_controllers_is_not_applicable() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(evacuate(dir.path()), Evacuation::NotApplicable);
        assert!(!dir.path().join(CHILD_GROUP).exists());
    }

    #[test]
    fn evacuate_moves_pids_and_enables_controllers() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
        fs::write(dir.path().join("cgroup.procs"), "1\n27\n301\n").unwrap();

        let outcome = evacuate(dir.path());

        assert_eq!(
            outcome,
            Evacuation::Evacuated {
                moved: vec![1, 27, 301],
                controllers: vec![
                    "cpuset".to_string(),
                    "cpu".to_string(),
                    "io".to_string(),
                    "memory".to_string(),
                    "pids".to_string()
                ],
                warnings: vec![],
            }
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("init/cgroup.procs")).unwrap(),
            "1\n27\n301\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("cgroup.subtree_control")).unwrap(),
            "+cpuset +cpu +io +memory +pids"
        );
    }

    #[test]
    fn evacuate_ignores_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        // No cgroup.procs, and the child group path is taken by a file.
        fs::write(dir.path().join(CHILD_GROUP), "not a directory").unwrap();

        match evacuate(dir.path()) {
            Evacuation::Evacuated {
                moved,
                controllers,
                warnings,
            } => {
                assert!(moved.is_empty());
                assert_eq!(controllers, vec!["cpu", "memory"]);
                assert_eq!(warnings.len(), 2, "{:?}", warnings);
            }
            other => panic!("expected an evacuation, got {:?}", other),
        }
    }
}
