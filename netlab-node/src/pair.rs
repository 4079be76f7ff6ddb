//! Virtual interface pairs: veth on Linux, `epair(4)` on FreeBSD, `pair(4)` on OpenBSD.

use std::time::Duration;

use netlab_common::{Platform, Retry};

use crate::{
    command::{ExecContext, Isolation, Output},
    node::Node,
    Env, Error, Result,
};

/// Moving an interface can race with the target namespace coming up.
pub const MOVE_RETRY: Retry = Retry::new(3, Duration::from_millis(1));

/// Names and optional addresses of a pair to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSpec {
    pub first: String,
    pub second: String,
    pub first_mac: Option<String>,
    pub second_mac: Option<String>,
}

impl PairSpec {
    /// Endpoints `first` and `second` with kernel-assigned MACs.
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self { first: first.into(), second: second.into(), ..Default::default() }
    }

    /// Fixes the MAC addresses of either end.
    pub fn with_macs(mut self, first: Option<String>, second: Option<String>) -> Self {
        self.first_mac = first;
        self.second_mac = second;
        self
    }
}

/// OS device names of a created pair. They differ from the requested names only on OpenBSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntfPair {
    pub first: String,
    pub second: String,
}

fn context_of(node: Option<&Node>) -> Result<ExecContext> {
    node.map_or_else(|| Ok(ExecContext::host()), Node::context)
}

fn is_absent(output: &Output) -> bool {
    let text = output.combined().to_lowercase();
    ["cannot find device", "does not exist", "no such"].iter().any(|needle| text.contains(needle))
}

async fn checked(env: &Env, ctx: &ExecContext, cmd: &str) -> Result<Output> {
    Ok(env.shell.exec(ctx, cmd).await?.into_result(cmd)?)
}

/// Creates a connected pair with the first end owned by `first_node` and the second end placed
/// directly into `second_node`. `None` stands for the host. Stale devices with the same names are
/// removed first.
pub async fn make_intf_pair(
    env: &Env,
    spec: &PairSpec,
    first_node: Option<&Node>,
    second_node: Option<&Node>,
) -> Result<IntfPair> {
    let first_ctx = context_of(first_node)?;
    let second_ctx = context_of(second_node)?;

    let pair = match env.platform {
        Platform::Linux => {
            delete_in(env, &first_ctx, &spec.first).await?;
            delete_in(env, &second_ctx, &spec.second).await?;

            let netns = match second_node {
                Some(node) if node.in_namespace() => {
                    node.pid().ok_or_else(|| Error::NotStarted(node.name().to_owned()))?
                }
                _ => 1,
            };

            let first_addr = spec.first_mac.as_ref().map(|mac| format!(" address {mac}")).unwrap_or_default();
            let second_addr = spec.second_mac.as_ref().map(|mac| format!(" address {mac}")).unwrap_or_default();
            let cmd = format!(
                "ip link add name {}{first_addr} type veth peer name {}{second_addr} netns {netns}",
                spec.first, spec.second
            );

            let output = env.shell.exec(&first_ctx, &cmd).await?;
            let text = output.combined();
            if !output.success() || !text.trim().is_empty() {
                return Err(Error::IntfPair {
                    first: spec.first.clone(),
                    second: spec.second.clone(),
                    output: text,
                });
            }

            IntfPair { first: spec.first.clone(), second: spec.second.clone() }
        }
        Platform::FreeBsd => {
            let host = ExecContext::host();
            let created = checked(env, &host, "ifconfig epair create").await?;
            let created = created.stdout.trim();
            let base = created.strip_suffix('a').filter(|base| !base.is_empty()).ok_or_else(|| {
                Error::IntfPair {
                    first: spec.first.clone(),
                    second: spec.second.clone(),
                    output: created.to_owned(),
                }
            })?;

            checked(env, &host, &format!("ifconfig {base}a name {}", spec.first)).await?;
            checked(env, &host, &format!("ifconfig {base}b name {}", spec.second)).await?;

            for (dev, mac, node) in [
                (&spec.first, &spec.first_mac, first_node),
                (&spec.second, &spec.second_mac, second_node),
            ] {
                if let Some(mac) = mac {
                    checked(env, &host, &format!("ifconfig {dev} ether {mac}")).await?;
                }
                if let Some(Isolation::Jail { name }) = node.and_then(Node::isolation) {
                    checked(env, &host, &format!("ifconfig {dev} vnet {name}")).await?;
                }
            }

            IntfPair { first: spec.first.clone(), second: spec.second.clone() }
        }
        Platform::OpenBsd => {
            let host = ExecContext::host();
            let unit = env.registry.allocate_pair_units();
            let (first, second) = (format!("pair{unit}"), format!("pair{}", unit + 1));

            for (dev, mac, node) in [
                (&first, &spec.first_mac, first_node),
                (&second, &spec.second_mac, second_node),
            ] {
                checked(env, &host, &format!("ifconfig {dev} create")).await?;
                if let Some(mac) = mac {
                    checked(env, &host, &format!("ifconfig {dev} lladdr {mac}")).await?;
                }
                if let Some(Isolation::Rdomain { id }) = node.and_then(Node::isolation) {
                    checked(env, &host, &format!("ifconfig {dev} rdomain {id}")).await?;
                }
            }

            checked(env, &host, &format!("ifconfig {first} patch {second}")).await?;
            checked(env, &host, &format!("ifconfig {first} up")).await?;
            checked(env, &host, &format!("ifconfig {second} up")).await?;

            IntfPair { first, second }
        }
    };

    tracing::debug!(first = %pair.first, second = %pair.second, "created interface pair");

    Ok(pair)
}

fn delete_cmd(platform: Platform, dev: &str) -> String {
    match platform {
        Platform::Linux => format!("ip link del {dev}"),
        Platform::FreeBsd | Platform::OpenBsd => format!("ifconfig {dev} destroy"),
    }
}

async fn delete_in(env: &Env, ctx: &ExecContext, dev: &str) -> Result<bool> {
    let cmd = delete_cmd(env.platform, dev);
    let output = env.shell.exec(ctx, &cmd).await?;

    if output.success() {
        return Ok(true);
    }
    if is_absent(&output) {
        return Ok(false);
    }

    Err(crate::command::Error::NonZero { cmd, output }.into())
}

/// Deletes device `dev` as seen from `node`. Returns whether it existed; absence is not an error.
pub async fn delete_intf(node: &Node, dev: &str) -> Result<bool> {
    delete_in(node.env(), &node.context()?, dev).await
}

/// Deletes host device `dev`. Returns whether it existed.
pub async fn delete_host_intf(env: &Env, dev: &str) -> Result<bool> {
    delete_in(env, &ExecContext::host(), dev).await
}

/// Whether device `dev` exists as seen from `node` (or the host).
pub async fn intf_exists(env: &Env, node: Option<&Node>, dev: &str) -> Result<bool> {
    let ctx = context_of(node)?;
    let cmd = match env.platform {
        Platform::Linux => format!("ip link show {dev}"),
        Platform::FreeBsd | Platform::OpenBsd => format!("ifconfig {dev}"),
    };

    Ok(env.shell.exec(&ctx, &cmd).await?.success())
}

/// Moves device `dev` from `src` (or the host) into `dst`, retrying on transient failures.
pub async fn move_intf(env: &Env, dev: &str, src: Option<&Node>, dst: &Node) -> Result<()> {
    let ctx = context_of(src)?;

    let cmd = match (env.platform, dst.isolation()) {
        (Platform::Linux, Some(Isolation::Namespace { pid })) => format!("ip link set {dev} netns {pid}"),
        (Platform::Linux, _) if !dst.in_namespace() => format!("ip link set {dev} netns 1"),
        (Platform::FreeBsd, Some(Isolation::Jail { name })) => format!("ifconfig {dev} vnet {name}"),
        (Platform::OpenBsd, Some(Isolation::Rdomain { id })) => format!("ifconfig {dev} rdomain {id}"),
        _ => return Err(Error::NotStarted(dst.name().to_owned())),
    };

    let (shell, ctx, cmd) = (&env.shell, &ctx, &cmd);
    MOVE_RETRY
        .run(|_| async move {
            let output = shell.exec(ctx, cmd).await.map_err(|e| e.to_string())?;
            let text = output.combined();
            if output.success() && text.trim().is_empty() {
                Ok(())
            } else {
                tracing::debug!(cmd, %text, "interface move failed");
                Err(text)
            }
        })
        .await
        .map_err(|source| Error::MoveIntf { intf: dev.to_owned(), node: dst.name().to_owned(), source })?;

    tracing::debug!(intf = dev, node = dst.name(), "moved interface");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlab_common::Registry;

    use super::*;
    use crate::{mock::MockShell, NodeOptions};

    fn env(shell: &Arc<MockShell>, platform: Platform) -> Env {
        Env::new(shell.clone(), platform, Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn veth_peer_lands_in_the_target_namespace() {
        let shell = Arc::new(MockShell::new());
        let env = env(&shell, Platform::Linux);
        let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
        h1.start_shell().await.unwrap();
        let pid = h1.pid().unwrap();
        shell.clear();

        let spec = PairSpec::new("s1-eth1", "h1-eth0")
            .with_macs(None, Some("00:00:00:00:00:01".into()));
        let pair = make_intf_pair(&env, &spec, None, Some(&h1)).await.unwrap();

        assert_eq!(pair, IntfPair { first: "s1-eth1".into(), second: "h1-eth0".into() });
        let commands = shell.commands();
        assert_eq!(commands[0], "ip link del s1-eth1");
        assert_eq!(commands[1], "ip link del h1-eth0");
        assert_eq!(
            commands[2],
            format!("ip link add name s1-eth1 type veth peer name h1-eth0 address 00:00:00:00:00:01 netns {pid}")
        );
    }

    #[tokio::test]
    async fn any_output_fails_pair_creation() {
        let shell = Arc::new(MockShell::new());
        shell.respond("ip link add", "RTNETLINK answers: File exists");
        let env = env(&shell, Platform::Linux);

        let err = make_intf_pair(&env, &PairSpec::new("a", "b"), None, None).await.unwrap_err();
        assert!(matches!(err, Error::IntfPair { output, .. } if output.contains("File exists")));
    }

    #[tokio::test]
    async fn deleting_a_missing_interface_is_fine() {
        let shell = Arc::new(MockShell::new());
        shell.fail("ip link del gone", 1, "Cannot find device \"gone\"");
        shell.fail("ip link del busy", 2, "Operation not permitted");
        let env = env(&shell, Platform::Linux);

        assert!(!delete_host_intf(&env, "gone").await.unwrap());
        assert!(delete_host_intf(&env, "there").await.unwrap());
        assert!(delete_host_intf(&env, "busy").await.is_err());
    }

    #[tokio::test]
    async fn move_retries_then_gives_up() {
        let shell = Arc::new(MockShell::new());
        shell.fail("netns", 2, "Invalid argument");
        let env = env(&shell, Platform::Linux);
        let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
        h1.start_shell().await.unwrap();

        let err = move_intf(&env, "h1-eth0", None, &h1).await.unwrap_err();

        assert!(matches!(err, Error::MoveIntf { source, .. } if source.attempts == 3));
        assert_eq!(shell.count("ip link set h1-eth0 netns"), 3);
    }

    #[tokio::test]
    async fn move_succeeds_after_a_transient_failure() {
        let shell = Arc::new(MockShell::new());
        shell.respond_times("netns", Output::new(2, "", "Device or resource busy"), 1);
        let env = env(&shell, Platform::Linux);
        let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
        h1.start_shell().await.unwrap();

        move_intf(&env, "h1-eth0", None, &h1).await.unwrap();
        assert_eq!(shell.count("netns"), 2);
    }

    #[tokio::test]
    async fn freebsd_epair_is_renamed_and_jailed() {
        let shell = Arc::new(MockShell::new());
        shell.respond("epair create", "epair3a\n");
        let env = env(&shell, Platform::FreeBsd);
        let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
        h1.start_shell().await.unwrap();
        shell.clear();

        make_intf_pair(&env, &PairSpec::new("s1-eth1", "h1-eth0"), None, Some(&h1)).await.unwrap();

        assert_eq!(
            shell.commands(),
            [
                "ifconfig epair create",
                "ifconfig epair3a name s1-eth1",
                "ifconfig epair3b name h1-eth0",
                "ifconfig h1-eth0 vnet h1",
            ]
        );
    }

    #[tokio::test]
    async fn openbsd_pairs_are_patched() {
        let shell = Arc::new(MockShell::new());
        let env = env(&shell, Platform::OpenBsd);

        let first = make_intf_pair(&env, &PairSpec::new("s1-eth1", "s2-eth1"), None, None).await.unwrap();
        let second = make_intf_pair(&env, &PairSpec::new("s1-eth2", "s3-eth1"), None, None).await.unwrap();

        assert_eq!(first, IntfPair { first: "pair0".into(), second: "pair1".into() });
        assert_eq!(second.first, "pair2");
        assert_eq!(shell.count("ifconfig pair0 patch pair1"), 1);
    }
}
