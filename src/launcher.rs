//! Replica cluster launcher: validates the request, plans every replica's
//! command line, starts replicas one after another with a stagger interval,
//! then parks until told to terminate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;

use crate::payload::{PayloadFormat, ReplicaConfig};
use crate::topology::{PeerPolicy, ReplicaAddrs, ReplicaId, Topology};
use crate::utils::PaxbootError;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Configuration parameters struct of the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherConfig {
    /// Path to the replica server executable.
    pub server_exe: String,

    /// Host IP every replica binds its sockets to.
    pub bind_host: IpAddr,

    /// Client-facing port of replica 0; replica `i` uses base + `i`.
    pub client_port_base: u16,

    /// Peer-peer port of replica 0; replica `i` uses base + `i`.
    pub peer_port_base: u16,

    /// Pause between two consecutive replica starts in millisecs.
    pub stagger_ms: u64,

    /// How each replica's configuration is put on its command line.
    pub payload_format: PayloadFormat,

    /// Which peer addresses each replica gets told about.
    pub peer_policy: PeerPolicy,

    /// Terminate all started replicas when the launcher is told to exit.
    pub reap_on_exit: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        LauncherConfig {
            server_exe: "./server".into(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port_base: 8000,
            peer_port_base: 9000,
            stagger_ms: 2000,
            payload_format: PayloadFormat::TextFormat,
            peer_policy: PeerPolicy::IncludeSelf,
            reap_on_exit: true,
        }
    }
}

impl LauncherConfig {
    /// Composes a config from defaults overwritten by the given TOML string.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, PaxbootError> {
        parsed_config!(config_str => LauncherConfig;
                       server_exe, bind_host, client_port_base,
                       peer_port_base, stagger_ms, payload_format,
                       peer_policy, reap_on_exit)
    }
}

/// Result-bearing process start operation, the seam between the launcher and
/// the operating system.
pub trait ReplicaSpawner {
    /// Handle to a started replica.
    type Handle;

    /// Starts replica `id` running `exe` with `args`. Must not wait for the
    /// replica to become ready.
    fn spawn(
        &mut self,
        id: ReplicaId,
        exe: &str,
        args: &[String],
    ) -> Result<Self::Handle, PaxbootError>;

    /// Asks a started replica to terminate.
    fn terminate(
        &mut self,
        id: ReplicaId,
        handle: &mut Self::Handle,
    ) -> Result<(), PaxbootError>;
}

/// Spawner of real OS processes. Children inherit the launcher's stdout and
/// stderr; their stdin is closed.
#[derive(Debug, Default)]
pub struct ProcessSpawner;

impl ReplicaSpawner for ProcessSpawner {
    type Handle = Child;

    fn spawn(
        &mut self,
        _id: ReplicaId,
        exe: &str,
        args: &[String],
    ) -> Result<Child, PaxbootError> {
        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        Ok(child)
    }

    fn terminate(
        &mut self,
        id: ReplicaId,
        child: &mut Child,
    ) -> Result<(), PaxbootError> {
        if let Some(status) = child.try_wait()? {
            pf_debug!("replica {} already exited with {}", id, status);
            return Ok(());
        }
        child.start_kill()?;
        Ok(())
    }
}

/// Everything needed to start one replica, computed before any start.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Replica index.
    pub id: ReplicaId,

    /// Replica's allocated address pair.
    pub addrs: ReplicaAddrs,

    /// Configuration handed to the replica.
    pub config: ReplicaConfig,

    /// Encoded command line arguments, executable excluded.
    pub args: Vec<String>,
}

impl LaunchPlan {
    /// Renders a shell-pasteable command line for this replica.
    pub fn command_line(&self, exe: &str) -> String {
        let mut line = shell_word(exe);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_word(arg));
        }
        line
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "replica {} ({})", self.id, self.addrs)
    }
}

/// Double-quotes a word if the shell would otherwise split or interpret it.
fn shell_word(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".:/_-=".contains(c))
    {
        return word.into();
    }
    let mut quoted = String::from("\"");
    for c in word.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Cluster launcher, owner of every started replica's handle.
pub struct Launcher<S: ReplicaSpawner> {
    /// Configuration parameters struct.
    config: LauncherConfig,

    /// Allocated address table.
    topology: Topology,

    /// Per-replica launch plans in ascending ID order.
    plans: Vec<LaunchPlan>,

    /// Process start operation provider.
    spawner: S,

    /// Handles of started replicas, in start order.
    children: Vec<(ReplicaId, S::Handle)>,
}

impl<S: ReplicaSpawner> Launcher<S> {
    /// Validates the launch request and plans every replica's command line.
    /// No process is started here, so any error leaves no side effect.
    pub fn new_and_setup(
        config: LauncherConfig,
        population: u8,
        fail_rate: Option<f64>,
        spawner: S,
    ) -> Result<Self, PaxbootError> {
        if config.server_exe.is_empty() {
            return Err(PaxbootError::msg("server_exe must not be empty"));
        }
        if let Some(rate) = fail_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PaxbootError::msg(format!(
                    "invalid fail_rate {}, must be within [0, 1]",
                    rate
                )));
            }
            if config.payload_format == PayloadFormat::Positional {
                return Err(PaxbootError::msg(format!(
                    "fail_rate {} given but payload_format is {}",
                    rate, config.payload_format
                )));
            }
        }

        let topology = Topology::allocate(
            population,
            config.bind_host,
            config.client_port_base,
            config.peer_port_base,
        )?;

        let mut plans = Vec::with_capacity(population as usize);
        for (id, &addrs) in topology.iter() {
            let replica_config = ReplicaConfig {
                my_addr: addrs.client,
                my_paxos: addrs.peer,
                fail_rate,
                replicas: topology.peers(id, config.peer_policy)?,
            };
            let args = replica_config.to_args(config.payload_format)?;
            plans.push(LaunchPlan {
                id,
                addrs,
                config: replica_config,
                args,
            });
        }

        Ok(Launcher {
            config,
            topology,
            plans,
            spawner,
            children: Vec::with_capacity(population as usize),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Allocated address table.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Per-replica launch plans in start order.
    pub fn plan(&self) -> &[LaunchPlan] {
        &self.plans
    }

    /// Number of replicas started and not yet terminated.
    pub fn launched(&self) -> usize {
        self.children.len()
    }

    /// Starts every replica in ascending ID order, pausing `stagger_ms`
    /// between two consecutive starts. The first failed start aborts the
    /// launch and terminates the replicas already started.
    ///
    /// A termination signal caught on `rx_term` before the last start stops
    /// the launch: no further replica is started and the started ones are
    /// handled as on exit. Returns `Ok(true)` if every replica got started,
    /// or `Ok(false)` if the launch was cut short by a signal.
    pub async fn launch(
        &mut self,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<bool, PaxbootError> {
        if !self.children.is_empty() {
            return logged_err!("cluster already launched");
        }

        let stagger = Duration::from_millis(self.config.stagger_ms);
        let mut failed = None;
        let mut interrupted = false;
        for (idx, plan) in self.plans.iter().enumerate() {
            if idx > 0 && !stagger.is_zero() {
                tokio::select! {
                    _ = time::sleep(stagger) => {},

                    // a closed channel disables this branch
                    Ok(()) = rx_term.changed() => {
                        interrupted = true;
                        break;
                    }
                }
            }
            if rx_term.has_changed().unwrap_or(false) {
                interrupted = true;
                break;
            }

            pf_info!("starting {}", plan);
            pf_debug!("  {}", plan.command_line(&self.config.server_exe));
            match self.spawner.spawn(
                plan.id,
                &self.config.server_exe,
                &plan.args,
            ) {
                Ok(handle) => self.children.push((plan.id, handle)),
                Err(e) => {
                    failed = Some((plan.id, plan.addrs, e));
                    break;
                }
            }
        }

        if let Some((id, addrs, e)) = failed {
            self.terminate_all();
            return logged_err!(
                "replica {} ({}) failed to start: {}",
                id,
                addrs,
                e
            );
        }

        if interrupted {
            pf_warn!(
                "launcher caught termination signal after {} of {} starts",
                self.children.len(),
                self.plans.len()
            );
            self.shutdown();
            return Ok(false);
        }

        let clients: Vec<String> = self
            .topology
            .iter()
            .map(|(_, addrs)| addrs.client.to_string())
            .collect();
        pf_info!(
            "all {} replicas launched, client addrs: {}",
            self.children.len(),
            clients.join(" ")
        );
        Ok(true)
    }

    /// Parks until the termination channel fires (or its sender is gone),
    /// then terminates all started replicas if `reap_on_exit` is set.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), PaxbootError> {
        if rx_term.changed().await.is_err() {
            pf_warn!("termination channel closed");
        } else {
            pf_warn!("launcher caught termination signal");
        }

        self.shutdown();
        Ok(())
    }

    /// Releases the started replicas on exit, terminating them only if
    /// `reap_on_exit` is set.
    fn shutdown(&mut self) {
        if self.config.reap_on_exit {
            self.terminate_all();
        } else {
            pf_info!("leaving {} replicas running", self.children.len());
            self.children.clear();
        }
    }

    /// Terminates every started replica, most recent first. Errors are
    /// logged and do not stop the sweep.
    pub fn terminate_all(&mut self) {
        while let Some((id, mut handle)) = self.children.pop() {
            pf_info!("terminating replica {}", id);
            if let Err(e) = self.spawner.terminate(id, &mut handle) {
                pf_error!("error terminating replica {}: {}", id, e);
            }
        }
    }
}
