use netlab::{
    limit::Error, node::mock::MockShell, HostLimits, LimitedHost, NodeOptions, Platform, Sched,
};

use crate::support::mock_env;

const MOUNTS: &str = "cgroup /sys/fs/cgroup tmpfs rw 0 0\ncpuset /sys/fs/cgroup/cpuset cgroup rw 0 0\n";

async fn limited(platform: Platform, sched: Sched) -> (std::sync::Arc<MockShell>, LimitedHost) {
    let (shell, env) = mock_env(platform);
    shell
        .respond("cat /proc/mounts", MOUNTS)
        .respond("grep -c processor", "4\n")
        .respond("sysctl -n hw.ncpu", "4\n");

    let limits = HostLimits::default().with_sched(sched);
    let host = LimitedHost::create("h1", NodeOptions::default(), env, limits).await.unwrap();
    (shell, host)
}

fn limit_commands(shell: &MockShell) -> Vec<String> {
    shell
        .commands()
        .into_iter()
        .filter(|cmd| cmd.starts_with("cgset") || cmd.starts_with("rctl") || cmd.starts_with("chrt"))
        .collect()
}

#[tokio::test]
async fn same_fraction_twice_applies_the_same_limits() {
    for (platform, sched) in [(Platform::Linux, Sched::Cfs), (Platform::Linux, Sched::Rt), (Platform::FreeBsd, Sched::Cfs)] {
        let (shell, mut host) = limited(platform, sched).await;

        host.config(Some(0.25), &[]).await.unwrap();
        let first = limit_commands(&shell);
        let bandwidth = host.bandwidth();
        shell.clear();

        host.config(Some(0.25), &[]).await.unwrap();

        assert!(!first.is_empty());
        assert_eq!(limit_commands(&shell), first, "{platform} {sched}");
        assert_eq!(host.bandwidth(), bandwidth);
    }
}

#[tokio::test]
async fn invalid_fractions_touch_nothing() {
    let (shell, mut host) = limited(Platform::Linux, Sched::Rt).await;

    for fraction in [-0.5, 0.0, f64::NAN] {
        let err = host.config(Some(fraction), &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFraction { .. }));
    }

    assert!(limit_commands(&shell).is_empty());
    assert_eq!(host.bandwidth(), None);
}

#[tokio::test]
async fn strategies_agree_on_effective_bandwidth() {
    for (platform, sched) in [(Platform::Linux, Sched::Cfs), (Platform::Linux, Sched::Rt), (Platform::FreeBsd, Sched::Cfs)] {
        let (_shell, mut host) = limited(platform, sched).await;

        host.config(Some(0.5), &[]).await.unwrap();

        let cores = host.bandwidth().unwrap();
        assert!((cores - 2.0).abs() < 1e-6, "{platform} {sched}: {cores}");
    }
}

#[tokio::test]
async fn tiny_cfs_fraction_widens_the_period() {
    let (shell, mut host) = limited(Platform::Linux, Sched::Cfs).await;

    // 1/1024 of four cores is a 390 µs quota per 100 ms.
    host.config(Some(1.0 / 1024.0), &[]).await.unwrap();

    assert_eq!(shell.count("cgset -r cpu.cfs_quota_us=1000 /h1"), 1);
    assert_eq!(shell.count("cgset -r cpu.cfs_period_us=256000 /h1"), 1);
    let cores = host.bandwidth().unwrap();
    assert!((cores - 4.0 / 1024.0).abs() < 1e-9);
}
