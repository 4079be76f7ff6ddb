use std::time::Duration;

use netlab::{
    batch_startup,
    node::mock::MockShell,
    switch::{OvsOptions, OvsSwitch, OvsVersion, ARGMAX},
    Env, Interface, LinkShaping, Platform, Switch, SwitchOptions,
};

use crate::support::mock_env;

const MODERN: OvsVersion = OvsVersion::new(2, 17);

fn shaped_switch(env: &Env, index: u32, batch: bool) -> OvsSwitch {
    let name = format!("s{index}");
    let mut switch =
        OvsSwitch::new(&name, &SwitchOptions::default(), OvsOptions::default().batch(batch), env.clone(), MODERN)
            .unwrap();

    let shaping = LinkShaping::default().with_bandwidth(10.0).with_delay(Duration::from_millis(5));
    for port in 1..=2 {
        let intf = Interface::new(format!("{name}-eth{port}")).with_shaping(shaping.clone());
        switch.node_mut().add_intf(intf, None).unwrap();
    }
    switch
}

fn tc_commands(shell: &MockShell) -> Vec<String> {
    shell.commands().into_iter().filter(|cmd| cmd.starts_with("tc ")).collect()
}

#[tokio::test]
async fn batched_start_leaves_the_same_traffic_control() {
    let (plain_shell, plain_env) = mock_env(Platform::Linux);
    let mut plain: Vec<OvsSwitch> = (1..=3).map(|i| shaped_switch(&plain_env, i, false)).collect();
    for switch in &mut plain {
        switch.start(&[]).await.unwrap();
    }

    let (batched_shell, batched_env) = mock_env(Platform::Linux);
    let mut batched: Vec<OvsSwitch> = (1..=3).map(|i| shaped_switch(&batched_env, i, true)).collect();
    for switch in &mut batched {
        switch.start(&[]).await.unwrap();
    }
    assert!(tc_commands(&batched_shell).is_empty());

    let mut refs: Vec<&mut OvsSwitch> = batched.iter_mut().collect();
    batch_startup(&batched_env, &mut refs, ARGMAX).await.unwrap();

    let expected = tc_commands(&plain_shell);
    assert!(!expected.is_empty());
    assert_eq!(tc_commands(&batched_shell), expected);
}

#[tokio::test]
async fn flush_respects_the_invocation_bound() {
    for per_call in 1..=4 {
        let (shell, env) = mock_env(Platform::Linux);
        let mut switches: Vec<OvsSwitch> = (1..=6).map(|i| shaped_switch(&env, i, true)).collect();
        let fragment = switches[0].start_args(&[]).trim().len();
        for switch in &mut switches {
            switch.start(&[]).await.unwrap();
        }

        let argmax = per_call * (fragment + 1) + "ovs-vsctl".len() + 1;
        let mut refs: Vec<&mut OvsSwitch> = switches.iter_mut().collect();
        let report = batch_startup(&env, &mut refs, argmax).await.unwrap();

        assert_eq!(report.invocations, 6usize.div_ceil(per_call));
        assert!(report.invocations <= report.bytes.div_ceil(argmax));
        for cmd in shell.commands().iter().filter(|cmd| cmd.starts_with("ovs-vsctl")) {
            assert!(cmd.len() < argmax, "{} bytes against a bound of {argmax}", cmd.len());
        }
    }
}
