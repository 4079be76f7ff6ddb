//! Running commands in a node's execution context.
//!
//! Every command the emulator issues goes through a [`Shell`]. The production implementation,
//! [`HostShell`], forks a real process and, before `exec`, moves it into the node's network and
//! mount namespaces, cgroup and scheduling class. Tests swap in a recording shell.
//!
//! Joining a namespace, a cgroup or a scheduling class has to happen in the child between
//! `fork` and `exec`: doing it from the parent afterwards would let the command run its first
//! instructions outside the node. Those steps are the `pre_exec` hooks below. They only issue
//! async-signal-safe system calls on values prepared in the parent, since the tokio runtime is
//! multithreaded and the child must not touch the allocator.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    os::unix::process::ExitStatusExt as _,
    path::{Path, PathBuf},
    process::{self, ExitStatus, Stdio},
};

use async_trait::async_trait;
use netlab_common::Platform;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Root of the cgroup v1 hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Controllers a limited node's processes are added to.
pub const CGROUP_CONTROLLERS: [&str; 3] = ["cpu", "cpuacct", "cpuset"];

/// A command that ran but failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("`{cmd}` failed: {output}")]
    NonZero { cmd: String, output: Output },
}

/// Result alias for command outcomes.
pub type Result<T> = std::result::Result<T, Error>;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// Builds an output with the given exit code.
    pub fn new(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::from_raw((code & 0xff) << 8),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or `None` when killed by a signal.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Standard output followed by standard error, the way an interactive shell shows them.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        text.push_str(&self.stderr);
        text
    }

    /// Turns a non-zero exit status into [`Error::NonZero`].
    pub fn into_result(self, cmd: &str) -> Result<Self> {
        if !self.success() {
            return Err(Error::NonZero { cmd: cmd.to_owned(), output: self });
        }

        Ok(self)
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

/// Where a node's processes live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Isolation {
    /// The host's own network stack.
    #[default]
    Host,
    /// Linux network and mount namespaces of the given process.
    Namespace { pid: u32 },
    /// A FreeBSD VNET jail.
    Jail { name: String },
    /// An OpenBSD routing domain.
    Rdomain { id: u32 },
}

/// Isolation requested for a node's holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolate {
    None,
    Namespace,
    Jail,
    Rdomain(u32),
}

/// Everything a command needs to run "inside" a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub isolation: Isolation,
    /// Name of the cgroup the process joins before `exec`.
    pub cgroup: Option<String>,
    /// `SCHED_RR` priority applied before `exec`.
    pub rt_priority: Option<i32>,
}

impl ExecContext {
    /// Runs on the host, without isolation or limits.
    pub fn host() -> Self {
        Self::default()
    }
}

/// What to do with a spawned process's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Piped,
    Log(PathBuf),
    Null,
}

/// A handle to a backgrounded process.
#[derive(Debug)]
pub struct Process {
    pid: Option<u32>,
    child: Option<Child>,
    completed: Option<Output>,
}

impl Process {
    /// Wraps a forked child.
    pub fn from_child(child: Child) -> Self {
        Self { pid: child.id(), child: Some(child), completed: None }
    }

    /// A process that already ran to completion, for shells that do not fork.
    pub fn completed(pid: u32, output: Output) -> Self {
        Self { pid: Some(pid), child: None, completed: Some(output) }
    }

    /// Pid, if the process was started and has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the process to exit and collects whatever it wrote to piped outputs.
    pub async fn wait_output(mut self) -> io::Result<Output> {
        if let Some(output) = self.completed.take() {
            return Ok(output);
        }

        match self.child.take() {
            Some(child) => Ok(child.wait_with_output().await?.into()),
            None => Ok(Output::new(0, "", "")),
        }
    }

    /// Kills the process and reaps it. A process that already exited is not an error.
    pub async fn kill(&mut self) -> io::Result<()> {
        let Some(child) = self.child.as_mut() else { return Ok(()) };

        match child.kill().await {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }

    /// Sends `signal` to the process. A process that no longer exists is not an error.
    pub fn signal(&self, sig: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else { return Ok(()) };
        send_signal(pid, sig)
    }
}

/// Sends `sig` to `pid`, treating a missing process as success.
pub fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The process (or jail) that anchors a node's isolation for as long as the node lives.
#[derive(Debug)]
pub struct Holder {
    /// Process id, or jail id for jails.
    pub pid: u32,
    pub isolation: Isolation,
    pub process: Option<Process>,
}

/// Executes commands on behalf of nodes.
#[async_trait]
pub trait Shell: Send + Sync + fmt::Debug {
    /// Runs `cmd` through `sh -c` in `ctx` and waits for it to finish.
    async fn exec(&self, ctx: &ExecContext, cmd: &str) -> io::Result<Output>;

    /// Spawns `argv` in `ctx` without waiting for it.
    async fn spawn(&self, ctx: &ExecContext, argv: &[String], capture: Capture)
        -> io::Result<Process>;

    /// Creates the holder of a new node named `name`.
    async fn spawn_holder(&self, name: &str, isolate: Isolate) -> io::Result<Holder>;

    /// Tears down what [`Shell::spawn_holder`] created.
    async fn release_holder(&self, holder: &mut Holder) -> io::Result<()>;
}

/// A [`Shell`] that runs real processes on this machine.
#[derive(Debug, Clone, Copy)]
pub struct HostShell {
    platform: Platform,
}

impl HostShell {
    /// A shell that isolates nodes the way `platform` does.
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }

    fn command(&self, ctx: &ExecContext, argv: &[String]) -> io::Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut cmd = match &ctx.isolation {
            Isolation::Host | Isolation::Namespace { .. } => Command::new(program),
            Isolation::Jail { name } => {
                let mut cmd = Command::new("jexec");
                cmd.arg(name).arg(program);
                cmd
            }
            Isolation::Rdomain { id } => {
                let mut cmd = Command::new("route");
                cmd.args(["-T", &id.to_string(), "exec"]).arg(program);
                cmd
            }
        };
        cmd.args(args).stdin(Stdio::null());

        if let Isolation::Namespace { pid } = ctx.isolation {
            enter_namespaces(&mut cmd, pid)?;
        }

        if let Some(group) = &ctx.cgroup {
            let tasks = open_cgroup_tasks(group)?;

            // SAFETY: the closure only calls getpid(2) and write(2) on descriptors opened here,
            // formatting the pid on the stack.
            unsafe {
                cmd.pre_exec(move || join_cgroup(&tasks));
            }
        }

        if let Some(priority) = ctx.rt_priority {
            // SAFETY: sched_setscheduler(2) is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || set_round_robin(priority));
            }
        }

        Ok(cmd)
    }
}

#[async_trait]
impl Shell for HostShell {
    async fn exec(&self, ctx: &ExecContext, cmd: &str) -> io::Result<Output> {
        let argv = ["sh".to_owned(), "-c".to_owned(), cmd.to_owned()];
        let mut command = self.command(ctx, &argv)?;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(isolation = ?ctx.isolation, cmd, "running command");

        let output: Output = command.output().await?.into();

        if !output.success() {
            tracing::debug!(?output.stderr, ?output.status, cmd, "command returned non-zero status");
        }

        Ok(output)
    }

    async fn spawn(
        &self,
        ctx: &ExecContext,
        argv: &[String],
        capture: Capture,
    ) -> io::Result<Process> {
        let mut command = self.command(ctx, argv)?;

        match capture {
            Capture::Piped => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            Capture::Log(path) => {
                let log = File::create(path)?;
                command.stdout(log.try_clone()?).stderr(log);
            }
            Capture::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        tracing::debug!(isolation = ?ctx.isolation, ?argv, "spawning process");

        Ok(Process::from_child(command.spawn()?))
    }

    async fn spawn_holder(&self, name: &str, isolate: Isolate) -> io::Result<Holder> {
        let [sleep, forever] = self.platform.holder_argv();

        let (mut cmd, isolation) = match isolate {
            Isolate::None => (Command::new(sleep), Isolation::Host),
            Isolate::Namespace => {
                let mut cmd = Command::new(sleep);
                isolate_namespaces(&mut cmd)?;
                // Filled in below, once the pid is known.
                (cmd, Isolation::Namespace { pid: 0 })
            }
            Isolate::Rdomain(id) => {
                let mut cmd = Command::new("route");
                cmd.args(["-T", &id.to_string(), "exec", sleep]);
                (cmd, Isolation::Rdomain { id })
            }
            Isolate::Jail => return create_jail(self, name).await,
        };

        cmd.arg(forever).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other(format!("holder of {name} exited immediately")))?;

        let isolation = match isolation {
            Isolation::Namespace { .. } => Isolation::Namespace { pid },
            other => other,
        };

        tracing::debug!(node = name, pid, ?isolation, "spawned holder");

        Ok(Holder { pid, isolation, process: Some(Process::from_child(child)) })
    }

    async fn release_holder(&self, holder: &mut Holder) -> io::Result<()> {
        if let Some(process) = holder.process.as_mut() {
            process.kill().await?;
        }

        if let Isolation::Jail { name } = &holder.isolation {
            let cmd = format!("jail -r {name}");
            let output = self.exec(&ExecContext::host(), &cmd).await?;
            if !output.success() {
                tracing::warn!(jail = name, %output, "failed to remove jail");
            }
        }

        Ok(())
    }
}

async fn create_jail(shell: &HostShell, name: &str) -> io::Result<Holder> {
    let host = ExecContext::host();

    let create = format!("jail -c name={name} vnet persist");
    let output = shell.exec(&host, &create).await?;
    if !output.success() {
        return Err(io::Error::other(format!("failed to create jail {name}: {output}")));
    }

    let output = shell.exec(&host, &format!("jls -j {name} jid")).await?;
    let jid = output
        .stdout
        .trim()
        .parse()
        .map_err(|_| io::Error::other(format!("unexpected jid for {name}: {}", output.stdout)))?;

    Ok(Holder { pid: jid, isolation: Isolation::Jail { name: name.to_owned() }, process: None })
}

/// The `tasks` files of `group` under every controller that has it, opened for writing.
fn open_cgroup_tasks(group: &str) -> io::Result<Vec<File>> {
    let tasks: Vec<File> = CGROUP_CONTROLLERS
        .iter()
        .map(|controller| Path::new(CGROUP_ROOT).join(controller).join(group).join("tasks"))
        .filter_map(|path| OpenOptions::new().write(true).open(path).ok())
        .collect();

    if tasks.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("no controller has cgroup {group}")));
    }

    Ok(tasks)
}

/// Decimal digits of `n`, written to the end of `buf`.
fn format_pid(mut n: u32, buf: &mut [u8; 10]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

fn join_cgroup(tasks: &[File]) -> io::Result<()> {
    let mut buf = [0; 10];
    let pid = format_pid(nix::unistd::getpid().as_raw().unsigned_abs(), &mut buf);

    let mut last = nix::errno::Errno::ENOENT;
    let mut joined = false;
    for task in tasks {
        match nix::unistd::write(task, pid) {
            Ok(_) => joined = true,
            Err(errno) => last = errno,
        }
    }

    if joined {
        Ok(())
    } else {
        Err(last.into())
    }
}

fn set_round_robin(priority: i32) -> io::Result<()> {
    // SAFETY: zeroed is a valid sched_param on every libc; only the priority is meaningful.
    let mut param: nix::libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    // SAFETY: `param` outlives the call.
    if unsafe { nix::libc::sched_setscheduler(0, nix::libc::SCHED_RR, &param) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn enter_namespaces(cmd: &mut Command, pid: u32) -> io::Result<()> {
    use nix::sched::{setns, CloneFlags};

    let net = File::open(format!("/proc/{pid}/ns/net"))?;
    let mnt = File::open(format!("/proc/{pid}/ns/mnt"))?;

    // SAFETY: only setns(2) runs between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            setns(&net, CloneFlags::CLONE_NEWNET)?;
            setns(&mnt, CloneFlags::CLONE_NEWNS)?;
            Ok(())
        });
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn isolate_namespaces(cmd: &mut Command) -> io::Result<()> {
    use nix::mount::{mount, MsFlags};
    use nix::sched::{unshare, CloneFlags};

    // SAFETY: the closure only issues setsid(2), unshare(2) and mount(2).
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            unshare(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWNS)?;
            // Keep our mounts from propagating back to the host.
            mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)?;
            // A fresh sysfs shows the new namespace's devices.
            mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::empty(), None::<&str>)?;
            Ok(())
        });
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enter_namespaces(_cmd: &mut Command, _pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "network namespaces require Linux"))
}

#[cfg(not(target_os = "linux"))]
fn isolate_namespaces(_cmd: &mut Command) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "network namespaces require Linux"))
}
