//! Configuration for a cluster session
//!
//! The simplest way to configure a session is [`Config::default_config`], or
//! turning on the "cli" feature and converting parsed [`Opts`].

use std::time::Duration;

use container_spec::{Reference, WaitPolicy};

use crate::error::Error;

#[cfg(feature = "cli")]
use structopt::StructOpt;

/// The k3s image used when none is configured.
pub const DEFAULT_IMAGE: &str = "rancher/k3s:latest";
const DEFAULT_HELPER_IMAGE: &str = "alpine";
const DEFAULT_KUBECTL_IMAGE: &str = "bitnami/kubectl";
const DEFAULT_VIEWER_IMAGE: &str = "alpine:latest";
const DEFAULT_K9S_VERSION: &str = "v0.32.5";
const DEFAULT_CLIENT_USER: &str = "1001";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_DISABLED_COMPONENTS: [&str; 2] = ["traefik", "metrics-server"];

/// Images of the throwaway client containers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientImages {
    /// Image of the container that fetches the kubeconfig
    pub helper: Reference,
    /// Image with kubectl installed
    pub kubectl: Reference,
    /// Image k9s is installed into
    pub viewer: Reference,
}

impl Default for ClientImages {
    fn default() -> Self {
        ClientImages {
            helper: builtin(DEFAULT_HELPER_IMAGE),
            kubectl: builtin(DEFAULT_KUBECTL_IMAGE),
            viewer: builtin(DEFAULT_VIEWER_IMAGE),
        }
    }
}

/// Everything needed to construct a [`Session`](crate::Session).
#[derive(Clone, Debug)]
pub struct Config {
    /// The cluster name; keys every cache volume
    pub name: String,
    /// The k3s image
    pub image: Reference,
    /// Keep runtime data between sessions (not recommended)
    pub keep_state: bool,
    /// Use this API server port instead of probing for a free one
    pub port: Option<u16>,
    /// Packaged components passed to `k3s server --disable`
    pub disable: Vec<String>,
    /// Extra flags appended to `k3s server`
    pub server_args: Vec<String>,
    /// Images of the client containers
    pub images: ClientImages,
    /// k9s release installed by [`Session::kns`](crate::Session::kns)
    pub k9s_version: String,
    /// The unprivileged user client containers run as
    pub client_user: String,
    /// How fetching the kubeconfig waits for k3s to write it
    pub wait: WaitPolicy,
}

impl Config {
    /// Returns a Config for `name` with every other value set to its default.
    pub fn default_config(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            image: builtin(DEFAULT_IMAGE),
            keep_state: false,
            port: None,
            disable: DEFAULT_DISABLED_COMPONENTS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            server_args: Vec::new(),
            images: ClientImages::default(),
            k9s_version: DEFAULT_K9S_VERSION.to_string(),
            client_user: DEFAULT_CLIENT_USER.to_string(),
            wait: WaitPolicy {
                interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                deadline: None,
            },
        }
    }
}

/// Parses an image reference supplied by a user.
pub fn parse_image(image: &str) -> Result<Reference, Error> {
    image.parse().map_err(|source| Error::InvalidImage {
        image: image.to_string(),
        source,
    })
}

/// Rejects wait policies that would poll without pausing.
pub fn check_wait(wait: &WaitPolicy) -> Result<(), Error> {
    if wait.interval.is_zero() {
        return Err(Error::InvalidPollInterval);
    }
    Ok(())
}

// The defaults are constants; failing to parse one is a programming error.
fn builtin(image: &str) -> Reference {
    image
        .parse()
        .expect("built in image references are valid")
}

/// Command line options that configure a session.
///
/// Flatten these into an application's own options and convert them with
/// `Config::try_from`.
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
pub struct Opts {
    #[structopt(
        short = "n",
        long = "name",
        env = "K3S_SANDBOX_NAME",
        help = "Name of the cluster (required). Keys its cache volumes, so reusing a name reuses its state"
    )]
    name: Option<String>,

    #[structopt(
        long = "image",
        env = "K3S_SANDBOX_IMAGE",
        default_value = DEFAULT_IMAGE,
        help = "The k3s image to run"
    )]
    image: String,

    #[structopt(
        long = "keep-state",
        help = "Keep runtime data between runs (not recommended, stale node identity can break startup)"
    )]
    keep_state: bool,

    #[structopt(
        short = "p",
        long = "port",
        env = "K3S_SANDBOX_PORT",
        help = "API server port. Defaults to a free port picked by the OS"
    )]
    port: Option<u16>,

    #[structopt(
        long = "disable",
        env = "K3S_SANDBOX_DISABLE",
        use_delimiter = true,
        default_value = "traefik,metrics-server",
        help = "Packaged components to disable, separated by ','"
    )]
    disable: Vec<String>,

    #[structopt(
        long = "server-arg",
        number_of_values = 1,
        allow_hyphen_values = true,
        help = "Extra flag for `k3s server`. Can be repeated"
    )]
    server_args: Vec<String>,

    #[structopt(
        long = "kubectl-image",
        env = "K3S_SANDBOX_KUBECTL_IMAGE",
        default_value = DEFAULT_KUBECTL_IMAGE,
        help = "Image used to run kubectl"
    )]
    kubectl_image: String,

    #[structopt(
        long = "helper-image",
        env = "K3S_SANDBOX_HELPER_IMAGE",
        default_value = DEFAULT_HELPER_IMAGE,
        help = "Image used to fetch the kubeconfig"
    )]
    helper_image: String,

    #[structopt(
        long = "viewer-image",
        env = "K3S_SANDBOX_VIEWER_IMAGE",
        default_value = DEFAULT_VIEWER_IMAGE,
        help = "Image k9s is installed into"
    )]
    viewer_image: String,

    #[structopt(
        long = "k9s-version",
        env = "K3S_SANDBOX_K9S_VERSION",
        default_value = DEFAULT_K9S_VERSION,
        help = "k9s release to install"
    )]
    k9s_version: String,

    #[structopt(
        long = "poll-interval-ms",
        env = "K3S_SANDBOX_POLL_INTERVAL_MS",
        default_value = "500",
        help = "How often to check whether k3s wrote its kubeconfig"
    )]
    poll_interval_ms: u64,

    #[structopt(
        long = "wait-timeout",
        env = "K3S_SANDBOX_WAIT_TIMEOUT",
        help = "Seconds to wait for the kubeconfig before failing. Waits forever when unset"
    )]
    wait_timeout: Option<u64>,
}

#[cfg(feature = "cli")]
impl std::convert::TryFrom<Opts> for Config {
    type Error = Error;

    fn try_from(opts: Opts) -> Result<Self, Error> {
        let name = opts
            .name
            .filter(|n| !n.is_empty())
            .ok_or(Error::MissingName)?;
        let mut config = Config::default_config(name);
        config.image = parse_image(&opts.image)?;
        config.keep_state = opts.keep_state;
        config.port = opts.port;
        config.disable = opts.disable.into_iter().filter(|d| !d.is_empty()).collect();
        config.server_args = opts.server_args;
        config.images = ClientImages {
            helper: parse_image(&opts.helper_image)?,
            kubectl: parse_image(&opts.kubectl_image)?,
            viewer: parse_image(&opts.viewer_image)?,
        };
        config.k9s_version = opts.k9s_version;
        config.wait = WaitPolicy {
            interval: Duration::from_millis(opts.poll_interval_ms),
            deadline: opts.wait_timeout.map(Duration::from_secs),
        };
        check_wait(&config.wait)?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default_config("demo");
        assert_eq!(config.image.whole(), "docker.io/rancher/k3s:latest");
        assert!(!config.keep_state);
        assert_eq!(config.port, None);
        assert_eq!(config.disable, vec!["traefik", "metrics-server"]);
        assert_eq!(config.wait.interval, Duration::from_millis(500));
        assert_eq!(config.wait.deadline, None);
        assert_eq!(config.images.kubectl.repository(), "bitnami/kubectl");
    }

    #[test]
    fn user_images_are_validated() {
        assert_eq!(
            parse_image("alpine").expect("valid").whole(),
            "docker.io/library/alpine"
        );
        match parse_image("Rancher/K3s") {
            Err(Error::InvalidImage { image, .. }) => assert_eq!(image, "Rancher/K3s"),
            other => panic!("expected an invalid image, got {:?}", other),
        }
    }

    #[cfg(feature = "cli")]
    #[test]
    fn opts_convert_into_config() {
        use std::convert::TryFrom;

        let opts = Opts::from_iter_safe(vec![
            "k3s-sandbox",
            "--name",
            "ci",
            "--keep-state",
            "--port",
            "16443",
            "--disable",
            "traefik",
            "--server-arg",
            "--cluster-cidr=10.50.0.0/16",
            "--server-arg",
            "--flannel-backend=none",
            "--wait-timeout",
            "90",
        ])
        .expect("options should parse");
        let config = Config::try_from(opts).expect("valid options");
        assert_eq!(config.name, "ci");
        assert!(config.keep_state);
        assert_eq!(config.port, Some(16443));
        assert_eq!(config.disable, vec!["traefik"]);
        assert_eq!(
            config.server_args,
            vec!["--cluster-cidr=10.50.0.0/16", "--flannel-backend=none"]
        );
        assert_eq!(config.wait.deadline, Some(Duration::from_secs(90)));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn opts_with_bad_image_fail() {
        use std::convert::TryFrom;

        let opts = Opts::from_iter_safe(vec![
            "k3s-sandbox",
            "--name",
            "ci",
            "--image",
            "rancher/k3s:bad tag",
        ])
        .expect("options should parse");
        assert!(matches!(
            Config::try_from(opts),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn opts_without_name_fail() {
        use std::convert::TryFrom;

        let opts = Opts::from_iter_safe(vec!["k3s-sandbox"]).expect("options should parse");
        assert!(matches!(Config::try_from(opts), Err(Error::MissingName)));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn opts_with_zero_poll_interval_fail() {
        use std::convert::TryFrom;

        let opts = Opts::from_iter_safe(vec![
            "k3s-sandbox",
            "--name",
            "ci",
            "--poll-interval-ms",
            "0",
        ])
        .expect("options should parse");
        assert!(matches!(
            Config::try_from(opts),
            Err(Error::InvalidPollInterval)
        ));
    }

    #[test]
    fn zero_interval_wait_is_rejected() {
        let busy = WaitPolicy {
            interval: Duration::from_millis(0),
            deadline: None,
        };
        assert!(matches!(check_wait(&busy), Err(Error::InvalidPollInterval)));
        assert!(check_wait(&WaitPolicy::default()).is_ok());
    }
}
