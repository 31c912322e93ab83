//! Remote execution for OrbStack machines through the `ssh`/`scp` login
//! wrapper at `<user>@<machine>@orb`.

use std::path::Path;

use super::RemoteExec;
use crate::error::FleetError;
use crate::shell::CommandRunner;

pub struct OrbLogin<R> {
    runner: R,
    user: String,
}

fn machine_of(target: &str) -> &str {
    target.strip_suffix("@orb").unwrap_or(target)
}

impl<R: CommandRunner> OrbLogin<R> {
    pub fn new(runner: R, user: &str) -> Self {
        Self {
            runner,
            user: user.to_string(),
        }
    }

    fn login(&self, target: &str) -> String {
        format!("{}@{}@orb", self.user, machine_of(target))
    }
}

impl<R: CommandRunner> RemoteExec for OrbLogin<R> {
    /// Each line of `command` runs as its own login, in order; the first
    /// failing line stops the rest.
    async fn run(&self, target: &str, command: &str) -> Result<String, FleetError> {
        let login = self.login(target);
        let mut out = String::new();
        for line in command.lines().map(str::trim).filter(|l| !l.is_empty()) {
            out.push_str(
                &self
                    .runner
                    .checked("ssh", &["-o", "StrictHostKeyChecking=no", &login, line])
                    .await?,
            );
        }
        tracing::info!(target_addr = target, command, "remote command finished");
        Ok(out)
    }

    async fn copy(&self, target: &str, local: &Path, remote: &str) -> Result<(), FleetError> {
        let src = local.display().to_string();
        let dest = format!("{}:{remote}", self.login(target));
        self.runner
            .checked("scp", &["-o", "StrictHostKeyChecking=no", &src, &dest])
            .await?;
        tracing::info!(target_addr = target, local = %src, remote, "copied file");
        Ok(())
    }

    async fn probe(&self, target: &str) -> Result<(), FleetError> {
        let machine = machine_of(target);
        let out = self.runner.checked("orb", &["run", "-m", machine, "ip", "addr"]).await?;
        if out.trim().is_empty() {
            return Err(FleetError::Unready {
                id: machine.to_string(),
                message: "no network interfaces reported".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    #[tokio::test]
    async fn lines_run_in_order() {
        let login = OrbLogin::new(ScriptedRunner::default(), "root");
        login.run("demo-node-0@orb", "apt-get update\n\n  echo done  \n").await.unwrap();
        assert_eq!(
            login.runner.calls(),
            [
                "ssh -o StrictHostKeyChecking=no root@demo-node-0@orb apt-get update",
                "ssh -o StrictHostKeyChecking=no root@demo-node-0@orb echo done",
            ]
        );
    }

    #[tokio::test]
    async fn failing_line_stops_the_rest() {
        let login = OrbLogin::new(ScriptedRunner::default(), "root");
        login.runner.on("ssh -o StrictHostKeyChecking=no root@demo-node-0@orb false", false, "", "");
        assert!(login.run("demo-node-0", "false\necho never").await.is_err());
        assert_eq!(login.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn copy_and_probe() {
        let login = OrbLogin::new(ScriptedRunner::default(), "root");
        login.runner.on("orb run", true, "1: lo: <LOOPBACK>\n", "");
        login.copy("demo-node-0@orb", Path::new("/tmp/a"), "/opt/a").await.unwrap();
        login.probe("demo-node-0@orb").await.unwrap();
        assert_eq!(
            login.runner.calls(),
            [
                "scp -o StrictHostKeyChecking=no /tmp/a root@demo-node-0@orb:/opt/a",
                "orb run -m demo-node-0 ip addr",
            ]
        );
    }

    #[tokio::test]
    async fn empty_probe_is_unready() {
        let login = OrbLogin::new(ScriptedRunner::default(), "root");
        let err = login.probe("demo-node-0@orb").await.unwrap_err();
        assert!(matches!(err, FleetError::Unready { .. }));
    }
}
