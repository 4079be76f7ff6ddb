use netlab::{
    controller::{ControllerOptions, ProcessController, RemoteController, Switchd, SwitchdOptions},
    make_intf_pair,
    switch::OvsVersion,
    Controller, ControllerKind, ControllerSettings, Interface, Node, NodeOptions, PairSpec, Platform,
    SetupInfo, Switch, SwitchKind, SwitchOptions,
};

use crate::support::{free_port, mock_env};

#[tokio::test]
async fn ovs_topology_comes_up_and_goes_away() {
    let (shell, env) = mock_env(Platform::Linux);
    shell
        .respond("which", "/usr/bin/found\n")
        .respond("ovs-vsctl --version", "ovs-vsctl (Open vSwitch) 2.17.9\n");

    let options = ControllerOptions::default().with_port(free_port().await);
    let mut c0 = ProcessController::new("c0", options, env.clone()).await.unwrap();
    c0.start().await.unwrap();

    let kind = SwitchKind::parse("default", env.platform).unwrap();
    let info = kind.setup(&env).await.unwrap();
    assert_eq!(info.ovs_version, Some(OvsVersion::new(2, 17)));
    let mut s1 = kind.build("s1", &SwitchOptions::default(), env.clone(), &info).unwrap();

    let mut h1 = Node::new("h1", NodeOptions::default(), env.clone());
    h1.start_shell().await.unwrap();

    make_intf_pair(&env, &PairSpec::new("s1-eth1", "h1-eth0"), None, Some(&h1)).await.unwrap();
    s1.node_mut().add_intf(Interface::new("s1-eth1"), None).unwrap();
    h1.add_intf(Interface::new("h1-eth0"), None).unwrap();

    s1.start(&[c0.endpoint().clone()]).await.unwrap();

    let add_br = shell.position("add-br s1").unwrap();
    assert!(shell.position("ip link add name s1-eth1").unwrap() < add_br);
    assert_eq!(shell.count("add-port s1 s1-eth1 -- set Interface s1-eth1 ofport_request=1"), 1);
    assert_eq!(shell.count(&format!("target=\\\"{}\\\"", c0.endpoint().target())), 1);

    assert!(!s1.connected().await);
    shell
        .respond("get Bridge s1 Controller", "[8c1a]\n")
        .respond("get Controller 8c1a is_connected", "true\n");
    assert!(s1.connected().await);

    s1.stop(true).await.unwrap();
    c0.stop().await.unwrap();
    h1.terminate().await.unwrap();

    assert!(add_br < shell.position("ovs-vsctl del-br s1").unwrap());
    assert_eq!(shell.count("ip link del s1-eth1"), 2);
}

#[tokio::test]
async fn unstarted_switches_answer_and_stop_quietly() {
    let info = SetupInfo { ovs_version: Some(OvsVersion::new(2, 17)), ..Default::default() };
    let backends = [
        (Platform::Linux, SwitchKind::Ovs),
        (Platform::Linux, SwitchKind::OvsBridge),
        (Platform::Linux, SwitchKind::User),
        (Platform::Linux, SwitchKind::Ivs),
        (Platform::Linux, SwitchKind::LinuxBridge),
        (Platform::FreeBsd, SwitchKind::IfBridge),
        (Platform::OpenBsd, SwitchKind::IfSwitch),
    ];

    for (platform, kind) in backends {
        let (_shell, env) = mock_env(platform);
        let mut switch = kind.build("s1", &SwitchOptions::default(), env, &info).unwrap();

        let first = switch.connected().await;
        assert_eq!(switch.connected().await, first, "{kind}");

        switch.stop(true).await.unwrap();
        switch.stop(true).await.unwrap();
    }
}

#[tokio::test]
async fn namespaced_switches_stop_before_starting() {
    let info = SetupInfo::default();

    for kind in [SwitchKind::User, SwitchKind::Ivs, SwitchKind::LinuxBridge] {
        let (shell, env) = mock_env(Platform::Linux);
        let options = SwitchOptions::default().in_namespace(true);
        let mut switch = kind.build("s1", &options, env, &info).unwrap();

        if kind == SwitchKind::User {
            assert!(!switch.connected().await);
        }
        switch.stop(true).await.unwrap();
        assert_eq!(shell.count("release-holder"), 0, "{kind}");
    }
}

#[tokio::test]
async fn unstarted_controllers_stop_quietly() {
    let (_shell, env) = mock_env(Platform::Linux);

    let options = ControllerOptions::default().with_port(free_port().await);
    let mut c0 = ProcessController::new("c0", options, env.clone()).await.unwrap();
    c0.stop().await.unwrap();
    assert!(!c0.is_running());

    let options = SwitchdOptions::default().with_port(free_port().await);
    let mut c1 = Switchd::new("c1", options, env.clone()).await.unwrap();
    c1.stop().await.unwrap();

    let mut c2 = RemoteController::new("c2", "127.0.0.1".parse().unwrap(), Some(free_port().await)).await;
    c2.stop().await.unwrap();

    assert!(ControllerKind::None.build("c3", env, &ControllerSettings::default()).await.unwrap().is_none());
}
