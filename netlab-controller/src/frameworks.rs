//! Launch lines of the controllers that ship with other projects.

use netlab_common::Platform;
use netlab_node::{deps, Env};

use crate::{process::PORT_PLACEHOLDER, ControllerOptions, Error, Result};

/// Names the Open vSwitch test controller has been shipped under.
pub const OVS_CONTROLLER_NAMES: [&str; 3] = ["ovs-controller", "test-controller", "ovs-testcontroller"];

/// The first Open vSwitch test controller found in `$PATH`.
pub async fn find_ovs_controller(env: &Env) -> Result<Option<String>> {
    for name in OVS_CONTROLLER_NAMES {
        if deps::which(env, name).await?.is_some() {
            return Ok(Some(name.to_owned()));
        }
    }

    Ok(None)
}

/// The Open vSwitch test controller, falling back to its oldest name when none is installed.
pub async fn ovs_controller_options(env: &Env) -> Result<ControllerOptions> {
    let command = find_ovs_controller(env).await?.unwrap_or_else(|| OVS_CONTROLLER_NAMES[0].to_owned());
    Ok(ControllerOptions::default().with_command(command))
}

/// NOX running `modules` (`packetdump` if empty). Needs `NOX_CORE_DIR`, looked up through `var`.
pub fn nox_options(
    modules: &[String],
    var: impl Fn(&str) -> Option<String>,
) -> Result<ControllerOptions> {
    let core_dir = var("NOX_CORE_DIR")
        .ok_or_else(|| Error::Precondition("please set missing NOX_CORE_DIR env var".into()))?;

    let modules = if modules.is_empty() {
        tracing::warn!("no NOX modules specified; running packetdump only");
        vec!["packetdump".to_owned()]
    } else {
        modules.to_vec()
    };

    let mut args = vec![
        "--libdir=/usr/local/lib".to_owned(),
        "-v".to_owned(),
        "-i".to_owned(),
        format!("ptcp:{PORT_PLACEHOLDER}"),
    ];
    args.extend(modules);

    Ok(ControllerOptions::default()
        .with_command(format!("{core_dir}/nox_core"))
        .with_args(args)
        .with_cdir(core_dir))
}

/// Ryu running `apps` (`simple_switch.py` if empty). On FreeBSD Ryu is found under Python's
/// site-packages, elsewhere under `$HOME/ryu`, looked up through `var`.
pub async fn ryu_options(
    env: &Env,
    apps: &[String],
    var: impl Fn(&str) -> Option<String>,
) -> Result<ControllerOptions> {
    let home = match env.platform {
        Platform::FreeBsd => {
            let output = env.run("python3 -c 'import site; print(site.getsitepackages()[0])'").await?;
            let site = output.stdout.trim().to_owned();
            if !output.success() || site.is_empty() {
                return Err(Error::Precondition("could not locate python site-packages for Ryu".into()));
            }
            site
        }
        Platform::Linux | Platform::OpenBsd => {
            let home = var("HOME").ok_or_else(|| Error::Precondition("HOME is not set".into()))?;
            format!("{home}/ryu")
        }
    };

    let app_dir = format!("{home}/ryu/app/");
    let apps = if apps.is_empty() {
        tracing::warn!("no Ryu modules specified; running simple_switch only");
        vec![format!("{app_dir}simple_switch.py")]
    } else {
        apps.to_vec()
    };

    let mut args = vec!["--ofp-tcp-listen-port".to_owned(), PORT_PLACEHOLDER.to_owned()];
    args.extend(apps);

    Ok(ControllerOptions::default().with_command("ryu-manager").with_args(args).with_cdir(app_dir))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlab_common::Registry;
    use netlab_node::mock::MockShell;

    use super::*;

    fn env(shell: &Arc<MockShell>, platform: Platform) -> Env {
        Env::new(shell.clone(), platform, Arc::new(Registry::new()))
    }

    #[test]
    fn nox_needs_its_core_dir() {
        assert!(matches!(nox_options(&[], |_| None), Err(Error::Precondition(_))));

        let options = nox_options(&[], |_| Some("/opt/nox/build/src".into())).unwrap();
        assert_eq!(options.command, "/opt/nox/build/src/nox_core");
        assert_eq!(options.rendered_args(), ["--libdir=/usr/local/lib", "-v", "-i", "ptcp:6653", "packetdump"]);
        assert_eq!(options.cdir.unwrap().to_str(), Some("/opt/nox/build/src"));
    }

    #[tokio::test]
    async fn ryu_defaults_to_simple_switch() {
        let shell = Arc::new(MockShell::new());
        let options = ryu_options(&env(&shell, Platform::Linux), &[], |var| (var == "HOME").then(|| "/home/op".into()))
            .await
            .unwrap();

        assert_eq!(options.command, "ryu-manager");
        assert_eq!(
            options.rendered_args(),
            ["--ofp-tcp-listen-port", "6653", "/home/op/ryu/ryu/app/simple_switch.py"]
        );
    }

    #[tokio::test]
    async fn ryu_without_home_fails() {
        let shell = Arc::new(MockShell::new());
        assert!(ryu_options(&env(&shell, Platform::Linux), &[], |_| None).await.is_err());
    }

    #[tokio::test]
    async fn ryu_on_freebsd_uses_site_packages() {
        let shell = Arc::new(MockShell::new());
        shell.respond("import site", "/usr/local/lib/python3.11/site-packages\n");

        let options = ryu_options(&env(&shell, Platform::FreeBsd), &["ryu.app.simple_switch_13".into()], |_| None)
            .await
            .unwrap();

        assert_eq!(options.cdir.unwrap().to_str(), Some("/usr/local/lib/python3.11/site-packages/ryu/app/"));
    }

    #[tokio::test]
    async fn ovs_controller_names_in_order() {
        let shell = Arc::new(MockShell::new());
        shell.fail("which", 1, "").respond("which ovs-testcontroller", "/usr/bin/ovs-testcontroller\n");

        assert_eq!(find_ovs_controller(&env(&shell, Platform::Linux)).await.unwrap().as_deref(), Some("ovs-testcontroller"));
    }
}
