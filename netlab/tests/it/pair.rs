use std::{collections::HashMap, io, sync::Arc};

use async_trait::async_trait;
use netlab::{
    make_intf_pair,
    node::{
        command::{Capture, ExecContext, Holder, Isolate, Output, Process},
        mock::MockShell,
        pair::{delete_host_intf, intf_exists},
    },
    Env, Node, NodeOptions, PairSpec, Platform, Registry, Shell,
};
use parking_lot::Mutex;

/// Keeps a table of veth devices, each mapped to its peer, and answers `ip link` against it.
#[derive(Debug, Default)]
struct VethShell {
    devices: Mutex<HashMap<String, String>>,
    holders: MockShell,
}

impl VethShell {
    fn ip_link(&self, cmd: &str) -> Output {
        let words: Vec<&str> = cmd.split_whitespace().collect();
        let mut devices = self.devices.lock();

        match words.as_slice() {
            ["ip", "link", "add", "name", first, rest @ ..] => {
                let Some(second) = rest.windows(3).find(|w| w[..2] == ["peer", "name"]).map(|w| w[2]) else {
                    return Output::new(1, "", "missing peer");
                };
                if devices.contains_key(*first) || devices.contains_key(second) {
                    return Output::new(2, "", "RTNETLINK answers: File exists");
                }
                devices.insert((*first).to_owned(), second.to_owned());
                devices.insert(second.to_owned(), (*first).to_owned());
                Output::new(0, "", "")
            }
            ["ip", "link", "del", dev] => match devices.remove(*dev) {
                Some(peer) => {
                    devices.remove(&peer);
                    Output::new(0, "", "")
                }
                None => Output::new(1, "", &format!("Cannot find device \"{dev}\"")),
            },
            ["ip", "link", "show", dev] if devices.contains_key(*dev) => Output::new(0, "", ""),
            ["ip", "link", "show", dev] => Output::new(1, "", &format!("Device \"{dev}\" does not exist.")),
            _ => Output::new(0, "", ""),
        }
    }
}

#[async_trait]
impl Shell for VethShell {
    async fn exec(&self, _ctx: &ExecContext, cmd: &str) -> io::Result<Output> {
        Ok(self.ip_link(cmd))
    }

    async fn spawn(&self, ctx: &ExecContext, argv: &[String], capture: Capture) -> io::Result<Process> {
        self.holders.spawn(ctx, argv, capture).await
    }

    async fn spawn_holder(&self, name: &str, isolate: Isolate) -> io::Result<Holder> {
        self.holders.spawn_holder(name, isolate).await
    }

    async fn release_holder(&self, holder: &mut Holder) -> io::Result<()> {
        self.holders.release_holder(holder).await
    }
}

#[tokio::test]
async fn created_pairs_leave_no_trace_once_deleted() {
    let _ = tracing_subscriber::fmt::try_init();

    let env = Env::new(Arc::new(VethShell::default()), Platform::Linux, Arc::new(Registry::new()));
    let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
    h1.start_shell().await.unwrap();

    for (first, second) in [("s1-eth1", "h1-eth0"), ("s1-eth2", "h1-eth1"), ("s9-eth17", "h1-eth2")] {
        make_intf_pair(&env, &PairSpec::new(first, second), None, Some(&h1)).await.unwrap();
        assert!(intf_exists(&env, None, first).await.unwrap());
        assert!(intf_exists(&env, None, second).await.unwrap());

        assert!(delete_host_intf(&env, first).await.unwrap());

        assert!(!intf_exists(&env, None, first).await.unwrap());
        assert!(!intf_exists(&env, None, second).await.unwrap());
        assert!(!delete_host_intf(&env, second).await.unwrap());
    }
}

#[tokio::test]
async fn stale_devices_are_replaced() {
    let env = Env::new(Arc::new(VethShell::default()), Platform::Linux, Arc::new(Registry::new()));

    make_intf_pair(&env, &PairSpec::new("s1-eth1", "s2-eth1"), None, None).await.unwrap();
    make_intf_pair(&env, &PairSpec::new("s1-eth1", "s2-eth1"), None, None).await.unwrap();

    assert!(intf_exists(&env, None, "s2-eth1").await.unwrap());
}
