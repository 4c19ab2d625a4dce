use std::convert::TryFrom;
use std::io::Write;
use std::str::FromStr;

use container_spec::{render, Container};
use k3s_session::config::{Config, Opts};
use k3s_session::{shim, Session};
use serde::Serialize;
use structopt::StructOpt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "k3s-sandbox",
    about = "Plans for a disposable k3s cluster and the clients that talk to it"
)]
struct Cli {
    #[structopt(flatten)]
    session: Opts,

    #[structopt(
        short = "o",
        long = "output",
        default_value = "yaml",
        possible_values = &["yaml", "json", "shell"],
        help = "How plans are printed"
    )]
    output: Output,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Print the k3s server service
    Server,
    /// Print the plan that fetches the cluster's kubeconfig
    Config {
        /// Point the kubeconfig at localhost
        #[structopt(long)]
        local: bool,
    },
    /// Print a container running kubectl against the cluster
    Kubectl {
        /// Arguments for kubectl, passed to the shell as is
        #[structopt(required = true)]
        args: Vec<String>,
    },
    /// Print a container with k9s set up for the cluster
    Kns,
    /// Evacuate the root cgroup, then exec the given command
    Shim {
        #[structopt(required = true, last = true)]
        command: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug)]
enum Output {
    Yaml,
    Json,
    Shell,
}

impl FromStr for Output {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yaml" => Ok(Output::Yaml),
            "json" => Ok(Output::Json),
            "shell" => Ok(Output::Shell),
            other => Err(anyhow::anyhow!("unknown output format {:?}", other)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Plans go to stdout, logs to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::from_args();
    match cli.command {
        Command::Shim { command } => exec_shim(&command),
        command => {
            let config = Config::try_from(cli.session)?;
            plan(Session::new(config)?, command, cli.output)
        }
    }
}

fn plan(session: Session, command: Command, output: Output) -> anyhow::Result<()> {
    info!(
        cluster = %session.name(),
        port = session.port(),
        image = %session.settings().image.whole(),
        "Session ready"
    );
    match command {
        Command::Server => {
            let server = session.server();
            let line = server.command();
            print(output, &server, server.container(), Some(line.as_slice()))
        }
        Command::Config { local } => {
            let file = session.config(local);
            print(output, &file, file.container(), None)
        }
        Command::Kubectl { args } => {
            let kubectl = session.kubectl(&args.join(" "));
            debug!(command = ?kubectl.last_exec(), "Planned kubectl");
            print(output, &kubectl, &kubectl, None)
        }
        Command::Kns => {
            let kns = session.kns();
            print(output, &kns, &kns, None)
        }
        Command::Shim { command } => exec_shim(&command),
    }
}

fn print<T: Serialize>(
    output: Output,
    plan: &T,
    container: &Container,
    service: Option<&[String]>,
) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match output {
        Output::Yaml => serde_yaml::to_writer(&mut out, plan)?,
        Output::Json => {
            serde_json::to_writer_pretty(&mut out, plan)?;
            writeln!(out)?;
        }
        Output::Shell => {
            for command in render::commands(container) {
                writeln!(out, "{}", render::shell_line(&command))?;
            }
            if let Some(command) = service {
                writeln!(out, "{}", render::shell_line(command))?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn exec_shim(command: &[String]) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    if let shim::Evacuation::Evacuated { warnings, .. } = shim::evacuate(shim::CGROUP_ROOT) {
        if !warnings.is_empty() {
            warn!(count = warnings.len(), "Cgroup evacuation was incomplete");
        }
    }
    // exec only returns on failure.
    let err = std::process::Command::new(&command[0])
        .args(&command[1..])
        .exec();
    Err(anyhow::Error::new(err).context(format!("Unable to exec {}", command[0])))
}

#[cfg(not(unix))]
fn exec_shim(_command: &[String]) -> anyhow::Result<()> {
    anyhow::bail!("the shim only runs on unix hosts")
}
