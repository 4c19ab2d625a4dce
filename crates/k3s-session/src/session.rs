//! A disposable k3s cluster and the client containers that talk to it.
//!
//! Every operation here only builds plans. Nothing runs until an
//! [`Engine`](container_spec::Engine) evaluates the returned value, so a
//! session can be constructed and inspected without any container runtime.

use std::fmt;
use std::sync::Arc;

use container_spec::{Container, File, FileOpts, Service, ServiceOpts, WaitPolicy};
use tracing::{debug, info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::{check_wait, Config};
use crate::error::Error;
use crate::kubeconfig;
use crate::name::ClusterName;
use crate::port;
use crate::shim;
use crate::state::{self, StateBinding};

/// Where client containers mount the configuration volume.
pub const CLIENT_CACHE_DIR: &str = "/cache/k3s";
/// Cache busting variable of the client containers.
pub const CLIENT_CACHE_ENV: &str = "CACHE";
const CLIENT_FILE_MODE: u32 = 0o600;
const K9S_RELEASES: &str = "https://github.com/derailed/k9s/releases/download";

/// Options for [`Session::config_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigOpts {
    /// Point the kubeconfig at `localhost` so it works from the host
    pub local: bool,
    /// How to wait for k3s to write the kubeconfig
    pub wait: WaitPolicy,
}

/// A named k3s cluster: its API server port, its storage, and the base
/// container k3s runs in.
#[derive(Clone)]
pub struct Session {
    name: ClusterName,
    port: u16,
    state: StateBinding,
    container: Container,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("container", &self.container)
            .finish()
    }
}

impl Session {
    /// Constructs a session using the wall clock for cache busting.
    pub fn new(config: Config) -> Result<Self, Error> {
        Session::with_clock(config, Arc::new(SystemClock))
    }

    /// Constructs a session.
    ///
    /// Validates the name, picks the API server port (the pinned one, or a
    /// free one found by [`port::allocate`]), binds the cluster storage and
    /// assembles the base container. Fails without side effects.
    ///
    /// An allocated port is free when it is probed but is not reserved; another
    /// process can take it before k3s binds it. Pin [`Config::port`] when that
    /// matters.
    #[instrument(level = "info", skip(config, clock), fields(name = %config.name))]
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let name = ClusterName::new(config.name.clone())?;
        check_wait(&config.wait)?;
        let port = match config.port {
            Some(port) if port != 0 => port,
            _ => port::allocate()?,
        };
        let state = state::bind(&name, config.keep_state);

        let base = shim::install(&Container::new().from(config.image.clone()));
        let container = state
            .apply(&base, clock.as_ref())
            .with_exposed_port(port);

        info!(port, keep_state = config.keep_state, image = %config.image.whole(), "Cluster session configured");
        Ok(Session {
            name,
            port,
            state,
            container,
            config,
            clock,
        })
    }

    /// The cluster name.
    pub fn name(&self) -> &ClusterName {
        &self.name
    }

    /// The API server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The cluster storage.
    pub fn state(&self) -> &StateBinding {
        &self.state
    }

    /// The container k3s runs in.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// The configuration the session was built from.
    pub fn settings(&self) -> &Config {
        &self.config
    }

    /// Replaces the base container. Nothing of the old one is kept, including
    /// the shim, the mounts and the exposed port.
    pub fn with_container(mut self, container: Container) -> Self {
        debug!(cluster = %self.name, "Replacing base container");
        self.container = container;
        self
    }

    /// The k3s server of this cluster. Starting it is up to the engine.
    pub fn server(&self) -> Service {
        self.container.as_service(ServiceOpts {
            args: vec!["sh".to_string(), "-c".to_string(), self.server_command()],
            insecure_root_capabilities: true,
            use_entrypoint: true,
        })
    }

    fn server_command(&self) -> String {
        let mut command = format!(
            "k3s server --debug --https-listen-port={} --bind-address $(ip route | grep src | awk '{{print $NF}}')",
            self.port
        );
        for component in &self.config.disable {
            command.push_str(" --disable ");
            command.push_str(component);
        }
        command.push_str(" --egress-selector-mode=disabled");
        for arg in &self.config.server_args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    /// The kubeconfig of the cluster, waiting with the configured policy.
    pub fn config(&self, local: bool) -> File {
        self.config_with(&ConfigOpts {
            local,
            wait: self.config.wait,
        })
    }

    /// The kubeconfig of the cluster.
    ///
    /// Evaluating the file blocks until k3s has written it. With `opts.local`
    /// the server address is rewritten to `localhost`, otherwise it is the
    /// address k3s bound inside its network.
    #[instrument(level = "debug", skip(self), fields(cluster = %self.name))]
    pub fn config_with(&self, opts: &ConfigOpts) -> File {
        let cached = format!("{}/{}", CLIENT_CACHE_DIR, kubeconfig::FILE_NAME);
        let port = self.port;
        Container::new()
            .from(self.config.images.helper.clone())
            .with_env_variable(CLIENT_CACHE_ENV, self.clock.cache_bust())
            .with_mounted_cache(CLIENT_CACHE_DIR, self.state.config_cache())
            .with_file_wait(&cached, opts.wait)
            .with_copied_file(&cached, kubeconfig::FILE_NAME)
            .with(|c| {
                if opts.local {
                    let (pattern, replacement) = kubeconfig::localize_rule(port);
                    c.with_substitution(kubeconfig::FILE_NAME, pattern, replacement)
                } else {
                    c.clone()
                }
            })
            .file(kubeconfig::FILE_NAME)
    }

    /// A container that runs `kubectl <args>` against the cluster. `args` is
    /// passed to the shell verbatim.
    #[instrument(level = "debug", skip(self), fields(cluster = %self.name))]
    pub fn kubectl(&self, args: &str) -> Container {
        Container::new()
            .from(self.config.images.kubectl.clone())
            .without_entrypoint()
            .with_mounted_cache(CLIENT_CACHE_DIR, self.state.config_cache())
            .with_env_variable(CLIENT_CACHE_ENV, self.clock.cache_bust())
            .with_file(kubeconfig::CLIENT_PATH, &self.config(false), self.client_file())
            .with_user(self.config.client_user.as_str())
            .with_exec(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("kubectl {}", args),
            ])
    }

    /// A container with k9s set up for the cluster, for interactive use.
    #[instrument(level = "debug", skip(self), fields(cluster = %self.name))]
    pub fn kns(&self) -> Container {
        let download = format!(
            "curl -L {}/{}/k9s_Linux_{}.tar.gz | tar -xz -C /usr/local/bin",
            K9S_RELEASES,
            self.config.k9s_version,
            k9s_arch(std::env::consts::ARCH)
        );
        Container::new()
            .from(self.config.images.viewer.clone())
            .with_exec(vec!["apk", "add", "--no-cache", "curl", "tar"])
            .with_exec(vec!["sh".to_string(), "-c".to_string(), download])
            .without_entrypoint()
            .with_mounted_cache(CLIENT_CACHE_DIR, self.state.config_cache())
            .with_env_variable(CLIENT_CACHE_ENV, self.clock.cache_bust())
            .with_env_variable(kubeconfig::KUBECONFIG, kubeconfig::CLIENT_PATH)
            .with_file(kubeconfig::CLIENT_PATH, &self.config(false), self.client_file())
            .with_default_terminal_cmd(vec!["k9s"])
    }

    fn client_file(&self) -> FileOpts {
        FileOpts {
            owner: Some(self.config.client_user.clone()),
            permissions: Some(CLIENT_FILE_MODE),
        }
    }
}

// k9s only publishes these two Linux archives for the images used here.
fn k9s_arch(host: &str) -> &'static str {
    match host {
        "aarch64" | "arm64" => "arm64",
        _ => "amd64",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{DateTime, Utc};
    use container_spec::Step;

    fn clock(at: &str) -> Arc<dyn Clock> {
        let instant = DateTime::parse_from_rfc3339(at)
            .expect("valid timestamp")
            .with_timezone(&Utc);
        Arc::new(FixedClock(instant))
    }

    fn session(name: &str) -> Session {
        let mut config = Config::default_config(name);
        config.port = Some(40123);
        Session::with_clock(config, clock("2024-01-02T03:04:05Z")).expect("valid session")
    }

    #[test]
    fn base_container_layout() {
        let s = session("demo");
        let steps = s.container().steps();
        assert!(matches!(&steps[0], Step::From { image } if image.repository() == "rancher/k3s"));
        assert!(matches!(&steps[1], Step::NewFile { path, .. } if path == shim::ENTRYPOINT_PATH));
        assert_eq!(
            steps[2],
            Step::Entrypoint {
                args: vec![shim::ENTRYPOINT.to_string()]
            }
        );
        assert_eq!(steps.last(), Some(&Step::ExposePort { port: 40123 }));
        assert_eq!(s.container().exposed_ports(), vec![40123]);
        assert_eq!(
            s.container().env().get(state::CACHE_BUST_ENV).map(String::as_str),
            Some("2024-01-02T03:04:05.000000000Z")
        );
    }

    #[test]
    fn invalid_name_is_rejected() {
        let err = Session::new(Config::default_config("")).expect_err("empty name");
        assert!(matches!(err, Error::InvalidName { .. }));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = Config::default_config("demo");
        config.port = Some(40123);
        config.wait.interval = std::time::Duration::from_millis(0);
        let err = Session::new(config).expect_err("busy wait");
        assert!(matches!(err, Error::InvalidPollInterval));
    }

    #[test]
    fn settings_are_kept() {
        let s = session("demo");
        assert_eq!(s.settings().name, "demo");
        assert_eq!(s.settings().port, Some(40123));
        assert_eq!(s.settings().k9s_version, "v0.32.5");
    }

    #[test]
    fn unpinned_port_is_allocated() {
        let s = Session::new(Config::default_config("demo")).expect("valid session");
        assert_ne!(s.port(), 0);
        assert_eq!(s.container().exposed_ports(), vec![s.port()]);
    }

    #[test]
    fn server_command_line() {
        let service = session("demo").server();
        assert!(service.opts().insecure_root_capabilities);
        assert!(service.opts().use_entrypoint);
        assert_eq!(
            service.opts().args,
            vec![
                "sh",
                "-c",
                "k3s server --debug --https-listen-port=40123 --bind-address $(ip route | grep src | awk '{print $NF}') --disable traefik --disable metrics-server --egress-selector-mode=disabled"
            ]
        );
        assert_eq!(service.command()[0], shim::ENTRYPOINT);
        assert_eq!(service.ports(), vec![40123]);
    }

    #[test]
    fn server_honors_configured_components_and_args() {
        let mut config = Config::default_config("demo");
        config.port = Some(6443);
        config.disable = vec![];
        config.server_args = vec!["--cluster-cidr=10.50.0.0/16".to_string()];
        let service = Session::new(config).expect("valid session").server();
        assert!(service.opts().args[2].ends_with(
            "awk '{print $NF}') --egress-selector-mode=disabled --cluster-cidr=10.50.0.0/16"
        ));
    }

    #[test]
    fn local_config_substitutes_the_server_address() {
        let s = session("demo");
        let local = s.config(true);
        assert_eq!(local.path(), kubeconfig::FILE_NAME);
        assert_eq!(
            local.container().steps().last(),
            Some(&Step::Substitute {
                path: kubeconfig::FILE_NAME.to_string(),
                pattern: "https://.*:40123".to_string(),
                replacement: "https://localhost:40123".to_string(),
            })
        );

        let remote = s.config(false);
        assert!(!remote
            .container()
            .steps()
            .iter()
            .any(|step| matches!(step, Step::Substitute { .. })));
        assert_eq!(
            remote.container().cache_mounts().get(CLIENT_CACHE_DIR),
            Some(s.state().config_cache())
        );
    }

    #[test]
    fn config_waits_with_the_requested_policy() {
        let s = session("demo");
        let wait = WaitPolicy {
            interval: std::time::Duration::from_millis(10),
            deadline: Some(std::time::Duration::from_secs(1)),
        };
        let file = s.config_with(&ConfigOpts { local: false, wait });
        assert!(file.container().steps().contains(&Step::WaitForFile {
            path: "/cache/k3s/k3s.yaml".to_string(),
            wait,
        }));
    }

    #[test]
    fn kubectl_runs_unprivileged() {
        let c = session("demo").kubectl("get pods -A");
        let steps = c.steps();
        let n = steps.len();
        assert_eq!(
            steps[n - 2],
            Step::User {
                name: "1001".to_string()
            }
        );
        assert_eq!(
            steps[n - 1],
            Step::Exec {
                args: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "kubectl get pods -A".to_string()
                ]
            }
        );
        assert_eq!(
            c.last_exec(),
            Some(&["sh".to_string(), "-c".to_string(), "kubectl get pods -A".to_string()][..])
        );
        assert_eq!(c.image().map(|i| i.repository()), Some("bitnami/kubectl"));
        assert_eq!(c.entrypoint(), None);
        match &steps[n - 3] {
            Step::WithFile { path, opts, .. } => {
                assert_eq!(path, kubeconfig::CLIENT_PATH);
                assert_eq!(opts.owner.as_deref(), Some("1001"));
                assert_eq!(opts.permissions, Some(0o600));
            }
            other => panic!("expected the kubeconfig, got {:?}", other),
        }
    }

    #[test]
    fn kns_sets_up_k9s() {
        let c = session("demo").kns();
        assert_eq!(c.env().get("KUBECONFIG").map(String::as_str), Some("/.kube/config"));
        assert_eq!(
            c.steps().last(),
            Some(&Step::DefaultTerminalCmd {
                args: vec!["k9s".to_string()]
            })
        );
        let download = c
            .steps()
            .iter()
            .find_map(|s| match s {
                Step::Exec { args } if args[0] == "sh" => Some(args[2].clone()),
                _ => None,
            })
            .expect("download step");
        assert!(download.contains("/download/v0.32.5/k9s_Linux_"));
        assert!(download.ends_with("| tar -xz -C /usr/local/bin"));
    }

    #[test]
    fn k9s_architecture_follows_the_host() {
        assert_eq!(k9s_arch("x86_64"), "amd64");
        assert_eq!(k9s_arch("aarch64"), "arm64");
    }

    #[test]
    fn with_container_replaces_everything() {
        let replacement = Container::new().from("alpine".parse().expect("valid image"));
        let s = session("demo").with_container(replacement.clone());
        assert_eq!(s.container(), &replacement);
        assert_eq!(s.port(), 40123);
    }
}
