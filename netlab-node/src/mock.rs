//! A [`Shell`] that records commands instead of running them.

use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::command::{Capture, ExecContext, Holder, Isolate, Isolation, Output, Process, Shell};

/// First pid handed out by the mock.
const FIRST_PID: u32 = 4000;

/// One recorded command and the context it would have run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub ctx: ExecContext,
    pub cmd: String,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    output: Output,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    invocations: Vec<Invocation>,
    rules: Vec<Rule>,
    spawned: u32,
}

/// Records every command with its [`ExecContext`] and answers from configured rules.
///
/// A rule matches when its pattern is a substring of the command. The most recently added
/// matching rule wins; commands without a matching rule succeed with empty output.
#[derive(Debug, Default)]
pub struct MockShell {
    state: Mutex<State>,
}

impl MockShell {
    /// A shell with no rules: every command succeeds silently.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` with a successful `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(pattern, Output::new(0, stdout, ""), None)
    }

    /// Answers commands containing `pattern` with exit code `code` and `stderr`.
    pub fn fail(&self, pattern: &str, code: i32, stderr: &str) -> &Self {
        self.push(pattern, Output::new(code, "", stderr), None)
    }

    /// Answers the next `times` commands containing `pattern` with `output`, then falls through to
    /// older rules.
    pub fn respond_times(&self, pattern: &str, output: Output, times: usize) -> &Self {
        self.push(pattern, output, Some(times))
    }

    fn push(&self, pattern: &str, output: Output, remaining: Option<usize>) -> &Self {
        self.state.lock().rules.push(Rule { pattern: pattern.to_owned(), output, remaining });
        self
    }

    /// Every command seen so far, with its context.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// Every command seen so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().invocations.iter().map(|i| i.cmd.clone()).collect()
    }

    /// Number of recorded commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state.lock().invocations.iter().filter(|i| i.cmd.contains(pattern)).count()
    }

    /// Index of the first recorded command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.state.lock().invocations.iter().position(|i| i.cmd.contains(pattern))
    }

    /// Forgets recorded commands. Rules are kept.
    pub fn clear(&self) {
        self.state.lock().invocations.clear();
    }

    fn answer(&self, ctx: &ExecContext, cmd: &str) -> Output {
        let mut state = self.state.lock();
        state.invocations.push(Invocation { ctx: ctx.clone(), cmd: cmd.to_owned() });

        let rule = state
            .rules
            .iter_mut()
            .rev()
            .find(|rule| cmd.contains(&rule.pattern) && rule.remaining != Some(0));

        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.output.clone()
            }
            None => Output::new(0, "", ""),
        }
    }

    fn next_pid(&self) -> u32 {
        let mut state = self.state.lock();
        state.spawned += 1;
        FIRST_PID + state.spawned
    }
}

#[async_trait]
impl Shell for MockShell {
    async fn exec(&self, ctx: &ExecContext, cmd: &str) -> io::Result<Output> {
        Ok(self.answer(ctx, cmd))
    }

    async fn spawn(
        &self,
        ctx: &ExecContext,
        argv: &[String],
        _capture: Capture,
    ) -> io::Result<Process> {
        let output = self.answer(ctx, &argv.join(" "));
        Ok(Process::completed(self.next_pid(), output))
    }

    async fn spawn_holder(&self, name: &str, isolate: Isolate) -> io::Result<Holder> {
        let output = self.answer(&ExecContext::host(), &format!("spawn-holder {name}"));
        if !output.success() {
            return Err(io::Error::other(output.stderr));
        }

        let pid = self.next_pid();
        let isolation = match isolate {
            Isolate::None => Isolation::Host,
            Isolate::Namespace => Isolation::Namespace { pid },
            Isolate::Jail => Isolation::Jail { name: name.to_owned() },
            Isolate::Rdomain(id) => Isolation::Rdomain { id },
        };

        Ok(Holder { pid, isolation, process: None })
    }

    async fn release_holder(&self, holder: &mut Holder) -> io::Result<()> {
        let output = self.answer(&ExecContext::host(), &format!("release-holder {}", holder.pid));
        if !output.success() {
            return Err(io::Error::other(output.stderr));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_matching_rule_wins() {
        let shell = MockShell::new();
        shell.respond("ovs-vsctl", "generic").respond("ovs-vsctl -V", "2.17.0");

        let ctx = ExecContext::host();
        assert_eq!(shell.exec(&ctx, "ovs-vsctl -V").await.unwrap().stdout, "2.17.0");
        assert_eq!(shell.exec(&ctx, "ovs-vsctl show").await.unwrap().stdout, "generic");
        assert!(shell.exec(&ctx, "true").await.unwrap().success());
        assert_eq!(shell.count("ovs-vsctl"), 2);
    }

    #[tokio::test]
    async fn limited_rules_fall_through() {
        let shell = MockShell::new();
        shell.respond_times("ip link set", Output::new(1, "", "busy"), 2);

        let ctx = ExecContext::host();
        assert!(!shell.exec(&ctx, "ip link set a netns 1").await.unwrap().success());
        assert!(!shell.exec(&ctx, "ip link set a netns 1").await.unwrap().success());
        assert!(shell.exec(&ctx, "ip link set a netns 1").await.unwrap().success());
    }

    #[tokio::test]
    async fn records_context() {
        let shell = MockShell::new();
        let ctx = ExecContext { isolation: Isolation::Namespace { pid: 7 }, ..Default::default() };

        shell.exec(&ctx, "ip addr").await.unwrap();

        let invocations = shell.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].ctx, ctx);
        assert_eq!(shell.position("ip addr"), Some(0));
    }
}
