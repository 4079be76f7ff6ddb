use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use netlab_node::{deps, Env, Node, NodeOptions, Process};

use crate::{
    endpoint::{parse_address, Protocol, DEFAULT_IP, DEFAULT_PORT},
    probe, Controller, ControllerEndpoint, Result,
};

/// Replaced by the listening port in launch arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// How to launch a controller process and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub command: String,
    /// Launch arguments; [`PORT_PLACEHOLDER`] is replaced by the port.
    pub args: Vec<String>,
    /// Directory to launch from.
    pub cdir: Option<PathBuf>,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub in_namespace: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            command: "controller".to_owned(),
            args: vec!["-v".to_owned(), format!("ptcp:{PORT_PLACEHOLDER}")],
            cdir: None,
            ip: DEFAULT_IP,
            port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            in_namespace: false,
        }
    }
}

impl ControllerOptions {
    /// Overrides the controller executable.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Arguments appended to the command.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Directory the controller runs in.
    pub fn with_cdir(mut self, cdir: impl Into<PathBuf>) -> Self {
        self.cdir = Some(cdir.into());
        self
    }

    /// Address the controller listens on.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Port the controller listens on.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the address from `ip` or `ip:port`.
    pub fn with_address(mut self, address: &str) -> Result<Self> {
        let (ip, port) = parse_address(address)?;
        self.ip = ip;
        if let Some(port) = port {
            self.port = port;
        }
        Ok(self)
    }

    /// Runs the controller in its own namespace.
    pub fn in_namespace(mut self, in_namespace: bool) -> Self {
        self.in_namespace = in_namespace;
        self
    }

    /// Arguments with the port filled in.
    pub fn rendered_args(&self) -> Vec<String> {
        self.args.iter().map(|arg| arg.replace(PORT_PLACEHOLDER, &self.port.to_string())).collect()
    }

    /// The full argv, changing into `cdir` first when set.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        argv.extend(self.rendered_args());

        match &self.cdir {
            Some(cdir) => vec![
                "sh".to_owned(),
                "-c".to_owned(),
                format!("cd {} && exec {}", cdir.display(), argv.join(" ")),
            ],
            None => argv,
        }
    }
}

/// Log file of a controller named `name`.
pub fn log_path(name: &str) -> PathBuf {
    Path::new("/tmp").join(format!("{name}.log"))
}

/// A controller that runs as a background process under its own node.
#[derive(Debug)]
pub struct ProcessController {
    node: Node,
    options: ControllerOptions,
    endpoint: ControllerEndpoint,
    process: Option<Process>,
}

impl ProcessController {
    /// Refuses to construct when something already listens on the controller port.
    pub async fn new(name: impl Into<String>, options: ControllerOptions, env: Env) -> Result<Self> {
        let name = name.into();
        let endpoint =
            ControllerEndpoint::new(name.clone(), options.ip, options.port).with_protocol(options.protocol);

        probe::check_free(&env, &endpoint).await?;

        let node = Node::new(name, NodeOptions::default().in_namespace(options.in_namespace), env);

        Ok(Self { node, options, endpoint, process: None })
    }

    /// Options the controller was built with.
    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// The node the controller process runs on.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether the controller process was started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }
}

#[async_trait]
impl Controller for ProcessController {
    fn name(&self) -> &str {
        self.node.name()
    }

    fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    async fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }

        deps::path_check(self.node.env(), &[self.options.command.as_str()], &self.options.command).await?;
        self.node.start_shell().await?;

        let log = log_path(self.node.name());
        let process = self.node.popen(&self.options.argv(), Some(&log)).await?;

        tracing::info!(controller = %self.node.name(), target = %self.endpoint.target(), pid = ?process.pid(), "started controller");
        self.process = Some(process);

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.kill().await.map_err(netlab_node::Error::from)?;
            tracing::info!(controller = %self.node.name(), "stopped controller");
        }

        self.node.terminate().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlab_common::{Platform, Registry};
    use netlab_node::mock::MockShell;
    use tokio::net::TcpListener;

    use super::*;
    use crate::Error;

    fn env(shell: &Arc<MockShell>) -> Env {
        Env::new(shell.clone(), Platform::Linux, Arc::new(Registry::new()))
    }

    #[test]
    fn default_launch_line() {
        let options = ControllerOptions::default().with_port(6999);
        assert_eq!(options.argv(), ["controller", "-v", "ptcp:6999"]);
    }

    #[test]
    fn cdir_wraps_the_launch_line() {
        let options = ControllerOptions::default().with_command("nox_core").with_cdir("/opt/nox");
        assert_eq!(options.argv()[2], "cd /opt/nox && exec nox_core -v ptcp:6653");
    }

    #[test]
    fn address_shorthand_overrides_the_port() {
        let options = ControllerOptions::default().with_address("127.0.0.1:7000").unwrap();
        assert_eq!(options.port, 7000);
    }

    #[tokio::test]
    async fn refuses_a_busy_port() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shell = Arc::new(MockShell::new());
        shell.respond("ss -tlnp", &format!("State\nLISTEN 0 5 127.0.0.1:{port} users:((\"stray\",pid=9))\n"));

        let err = ProcessController::new("c0", ControllerOptions::default().with_port(port), env(&shell))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PortInUse { listeners, .. } if listeners.contains("stray")));
    }

    #[tokio::test]
    async fn start_then_stop() {
        let shell = Arc::new(MockShell::new());
        shell.respond("which controller", "/usr/bin/controller\n");
        let port = free_port().await;

        let mut c0 = ProcessController::new("c0", ControllerOptions::default().with_port(port), env(&shell))
            .await
            .unwrap();
        c0.start().await.unwrap();

        assert!(c0.is_running());
        assert_eq!(shell.count(&format!("controller -v ptcp:{port}")), 1);

        c0.stop().await.unwrap();
        assert!(!c0.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_fine() {
        let shell = Arc::new(MockShell::new());
        let port = free_port().await;

        let mut c0 = ProcessController::new("c0", ControllerOptions::default().with_port(port), env(&shell))
            .await
            .unwrap();

        c0.stop().await.unwrap();
        c0.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let shell = Arc::new(MockShell::new());
        shell.fail("which", 1, "");
        let port = free_port().await;

        let mut c0 = ProcessController::new("c0", ControllerOptions::default().with_port(port), env(&shell))
            .await
            .unwrap();

        assert!(matches!(
            c0.start().await,
            Err(Error::Node(netlab_node::Error::MissingExecutable { .. }))
        ));
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }
}
