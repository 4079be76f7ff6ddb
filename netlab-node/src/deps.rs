//! Checks for the external tools a backend needs.

use crate::{Env, Error, Result};

/// Device the user-space switch needs for its local port.
pub const TUN_DEVICE: &str = "/dev/net/tun";

/// Full path of `executable`, if it is in the host's `$PATH`.
pub async fn which(env: &Env, executable: &str) -> Result<Option<String>> {
    let output = env.run(&format!("which {executable}")).await?;
    let path = output.stdout.trim();

    Ok((output.success() && !path.is_empty()).then(|| path.to_owned()))
}

/// Fails with [`Error::MissingExecutable`] naming the first of `executables` that is missing.
/// `module` is the package an operator should install.
pub async fn path_check(env: &Env, executables: &[&str], module: &str) -> Result<()> {
    for executable in executables {
        if which(env, executable).await?.is_none() {
            let path = std::env::var("PATH").unwrap_or_default();
            tracing::error!(executable, module, "cannot find required executable");

            return Err(Error::MissingExecutable {
                executable: (*executable).to_owned(),
                module: module.to_owned(),
                path,
            });
        }
    }

    Ok(())
}

/// Makes sure the tun device exists, loading the module if needed.
pub async fn ensure_tun(env: &Env) -> Result<()> {
    let probe = format!("test -c {TUN_DEVICE}");
    if env.run(&probe).await?.success() {
        return Ok(());
    }

    tracing::info!("loading tun module");
    env.run("modprobe tun").await?;

    if !env.run(&probe).await?.success() {
        return Err(Error::Precondition(format!(
            "could not load the tun module; {TUN_DEVICE} is missing"
        )));
    }

    Ok(())
}
