//! Is anything listening on a controller port?

use std::{net::SocketAddr, time::Duration};

use netlab_common::Platform;
use netlab_node::Env;
use tokio::net::TcpStream;

use crate::{ControllerEndpoint, Error, Result};

/// How long a connection attempt may take before the port counts as closed.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether a TCP connection to `addr` succeeds within `timeout`.
pub async fn is_listening(addr: SocketAddr, timeout: Duration) -> bool {
    let listening = matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)));
    tracing::trace!(%addr, listening, "probed");
    listening
}

/// Lines of the host's socket table mentioning `port`, headed by the table's own header.
pub async fn listeners(env: &Env, port: u16) -> Result<String> {
    let (cmd, needle) = match env.platform {
        Platform::Linux => ("ss -tlnp".to_owned(), format!(":{port} ")),
        Platform::FreeBsd => (format!("sockstat -4 -6 -l -P tcp -p {port}"), format!(":{port} ")),
        Platform::OpenBsd => ("netstat -an -p tcp".to_owned(), format!(".{port} ")),
    };

    let output = env.run(&cmd).await?;
    let mut lines = output.stdout.lines();
    let header = lines.next().into_iter();

    Ok(header.chain(lines.filter(|line| line.contains(&needle))).collect::<Vec<_>>().join("\n"))
}

/// Fails if something already accepts connections at `endpoint`, naming what is listening.
pub async fn check_free(env: &Env, endpoint: &ControllerEndpoint) -> Result<()> {
    if !is_listening(endpoint.socket_addr(), PROBE_TIMEOUT).await {
        return Ok(());
    }

    let listeners = listeners(env, endpoint.port).await?;
    tracing::error!(controller = %endpoint.name, port = endpoint.port, %listeners, "port already in use");

    Err(Error::PortInUse { port: endpoint.port, listeners })
}
