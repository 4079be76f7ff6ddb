use netlab::{
    switch::{dpid, OvsVersion},
    Platform, SetupInfo, Switch, SwitchKind, SwitchOptions,
};

use crate::support::mock_env;

#[tokio::test]
async fn every_backend_derives_a_fixed_length_dpid() {
    let (_shell, env) = mock_env(Platform::Linux);
    let info = SetupInfo { ovs_version: Some(OvsVersion::new(2, 17)), ..Default::default() };

    let kinds = [
        (SwitchKind::Ovs, dpid::DEFAULT_LEN),
        (SwitchKind::OvsBridge, dpid::DEFAULT_LEN),
        (SwitchKind::User, dpid::USER_LEN),
        (SwitchKind::Ivs, dpid::DEFAULT_LEN),
        (SwitchKind::LinuxBridge, dpid::DEFAULT_LEN),
    ];

    for (kind, len) in kinds {
        for n in [1u64, 23, 300, 65_535] {
            let name = format!("s{n}");
            let switch = kind.build(&name, &SwitchOptions::default(), env.clone(), &info).unwrap();
            let dpid = switch.dpid();

            assert_eq!(dpid.as_str().len(), len, "{kind} {name}");
            assert_eq!(dpid.value(), n);
            assert!(dpid.as_str().ends_with(&format!("{n:x}")));
        }
    }
}

#[tokio::test]
async fn explicit_dpid_wins_over_the_name() {
    let (_shell, env) = mock_env(Platform::Linux);
    let info = SetupInfo { ovs_version: Some(OvsVersion::new(2, 17)), ..Default::default() };

    let options = SwitchOptions::default().with_dpid("00:00:00:00:00:00:0A:BC");
    let switch = SwitchKind::Ovs.build("s1", &options, env.clone(), &info).unwrap();
    assert_eq!(switch.dpid().as_str(), "0000000000000abc");

    assert!(SwitchKind::Ovs.build("edge", &SwitchOptions::default(), env, &info).is_err());
}
