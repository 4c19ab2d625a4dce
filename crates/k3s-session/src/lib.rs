//! A disposable, single node k3s cluster described as container plans.
//!
//! A [`Session`] ties a cluster name to an API server port and to two cache
//! volumes, and derives from them everything needed to run the cluster and
//! talk to it: the k3s [`server`](Session::server) service, its
//! [`kubeconfig`](Session::config), and client containers running
//! [`kubectl`](Session::kubectl) or [k9s](Session::kns).
//!
//! Plans are [`container_spec`] values. Running them is the job of an
//! [`Engine`](container_spec::Engine).
//!
//! ```rust
//! use k3s_session::{Config, Session};
//!
//! let mut config = Config::default_config("demo");
//! config.port = Some(6443);
//! let session = Session::new(config).unwrap();
//!
//! let server = session.server();
//! assert_eq!(server.ports(), vec![6443]);
//!
//! let pods = session.kubectl("get pods -A");
//! assert_eq!(pods.user(), Some("1001"));
//! ```

#![warn(missing_docs)]

mod error;
mod name;
mod session;

pub mod clock;
pub mod config;
pub mod kubeconfig;
pub mod port;
pub mod shim;
pub mod state;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::config::Config;
pub use self::error::Error;
pub use self::name::ClusterName;
pub use self::session::{ConfigOpts, Session, CLIENT_CACHE_DIR, CLIENT_CACHE_ENV};
pub use self::state::StateBinding;
