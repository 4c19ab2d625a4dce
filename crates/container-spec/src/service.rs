use serde::{Deserialize, Serialize};

use crate::Container;

/// Options for turning a container into a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOpts {
    /// The command the service runs
    pub args: Vec<String>,
    /// Grant the process root capabilities on the host
    pub insecure_root_capabilities: bool,
    /// Prefix `args` with the container entrypoint
    pub use_entrypoint: bool,
}

/// A long running process described by a container plan.
///
/// Building a service does not start anything; hand it to
/// [`Engine::start`](crate::Engine::start).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    container: Container,
    #[serde(flatten)]
    opts: ServiceOpts,
}

impl Service {
    pub(crate) fn new(container: Container, opts: ServiceOpts) -> Self {
        Service { container, opts }
    }

    /// The plan the service process runs in.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// The options the service was created with.
    pub fn opts(&self) -> &ServiceOpts {
        &self.opts
    }

    /// Ports the service publishes.
    pub fn ports(&self) -> Vec<u16> {
        self.container.exposed_ports()
    }

    /// The full command line, including the entrypoint when requested.
    pub fn command(&self) -> Vec<String> {
        let mut command = Vec::new();
        if self.opts.use_entrypoint {
            if let Some(entrypoint) = self.container.entrypoint() {
                command.extend(entrypoint.iter().cloned());
            }
        }
        command.extend(self.opts.args.iter().cloned());
        command
    }
}

/// A started service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    id: String,
    ports: Vec<u16>,
}

impl ServiceHandle {
    /// Creates a handle. Engines call this once the service is up.
    pub fn new(id: impl Into<String>, ports: Vec<u16>) -> Self {
        ServiceHandle {
            id: id.into(),
            ports,
        }
    }

    /// The engine's identifier for the running service.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ports the running service listens on.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_includes_entrypoint_when_requested() {
        let c = Container::new()
            .from("rancher/k3s".parse().unwrap())
            .with_entrypoint(vec!["entrypoint.sh"])
            .with_exposed_port(40123);
        let opts = ServiceOpts {
            args: vec!["sh".into(), "-c".into(), "k3s server".into()],
            insecure_root_capabilities: true,
            use_entrypoint: true,
        };

        let service = c.as_service(opts.clone());
        assert_eq!(
            service.command(),
            vec!["entrypoint.sh", "sh", "-c", "k3s server"]
        );
        assert_eq!(service.ports(), vec![40123]);

        let bare = c.as_service(ServiceOpts {
            use_entrypoint: false,
            ..opts
        });
        assert_eq!(bare.command(), vec!["sh", "-c", "k3s server"]);
    }
}
