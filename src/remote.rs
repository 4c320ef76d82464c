//! Typed remote commands and privilege escalation on the workers.
//!
//! A command crosses several interpretation boundaries on its way to the worker: the SSH
//! transport, the remote login shell, and the shell `sudo` spawns. `RemoteCmd` takes a
//! structured program-plus-arguments list and does all of the quoting itself, so call sites
//! never concatenate strings across those boundaries.

use log::warn;
use spurs::{cmd, Execute, SshOutput, SshShell};
use spurs_util::escape_for_bash;

use crate::config::SudoMode;

/// Quote one word for a POSIX shell, safe for another full round of shell interpretation.
/// Bare words pass through untouched; everything else is single-quoted via `escape_for_bash`.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b))
    {
        return s.to_owned();
    }

    escape_for_bash(s)
}

/// A remote command built from a structured argument list.
#[derive(Debug, Clone)]
pub struct RemoteCmd {
    program: String,
    args: Vec<String>,
    cwd: Option<String>,
}

impl RemoteCmd {
    pub fn new(program: impl Into<String>) -> Self {
        RemoteCmd {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// A full shell script run via `sh -c`. The script itself is a single quoted argument, so
    /// pipelines and `&&` chains survive the transport untouched.
    pub fn shell(script: impl Into<String>) -> Self {
        RemoteCmd::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Render to a single string safe for one more round of shell interpretation.
    pub fn to_shell_string(&self) -> String {
        let mut rendered = String::new();

        if let Some(ref cwd) = self.cwd {
            rendered.push_str("cd ");
            rendered.push_str(&sh_quote(cwd));
            rendered.push_str(" && ");
        }

        rendered.push_str(&sh_quote(&self.program));
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&sh_quote(arg));
        }

        rendered
    }
}

/// Run the command on the remote host under `sudo`.
///
/// In `Interactive` mode the session keeps its pty and the operator answers the remote sudo
/// password prompt. In `Scripted` mode the configured plaintext password is piped to
/// `sudo -S` for unattended runs -- note that the password then appears in the remote process
/// list and in debug-level command logs; this is the documented cost of unattended escalation.
pub fn remote_sudo(
    shell: &SshShell,
    mode: &SudoMode,
    remote_cmd: &RemoteCmd,
) -> Result<SshOutput, failure::Error> {
    let rendered = remote_cmd.to_shell_string();

    let out = match mode {
        SudoMode::Interactive => shell.run(cmd!("sudo {}", rendered))?,
        SudoMode::Scripted { password } => shell.run(
            cmd!("echo {} | sudo -S -p '' {}", sh_quote(password), rendered)
                .use_bash()
                .no_pty(),
        )?,
    };

    Ok(out)
}

/// The log-and-continue variant of `remote_sudo`: the failure is observed, never escalated.
pub fn try_remote_sudo(
    shell: &SshShell,
    mode: &SudoMode,
    remote_cmd: &RemoteCmd,
) -> Option<SshOutput> {
    match remote_sudo(shell, mode, remote_cmd) {
        Ok(out) => Some(out),
        Err(err) => {
            warn!("(tolerated) remote sudo `{}`: {}", remote_cmd.to_shell_string(), err);
            None
        }
    }
}

/// Run the command on the remote host as the service account (no escalation).
pub fn remote_run(shell: &SshShell, remote_cmd: &RemoteCmd) -> Result<SshOutput, failure::Error> {
    Ok(shell.run(cmd!("{}", remote_cmd.to_shell_string()))?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_words_pass_through() {
        assert_eq!(sh_quote("simple"), "simple");
        assert_eq!(sh_quote("/opt/hadoop-3.3.6/bin"), "/opt/hadoop-3.3.6/bin");
        assert_eq!(sh_quote("a=b"), "a=b");
    }

    #[test]
    fn adversarial_words_are_quoted() {
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("path with spaces"), "'path with spaces'");
        assert_eq!(sh_quote("$HOME"), "'$HOME'");
        assert_eq!(sh_quote("a&b"), "'a&b'");
        assert_eq!(sh_quote("`id`"), "'`id`'");
        // A single quote is closed, escaped, and reopened.
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn rendered_command_quotes_every_argument() {
        let cmd = RemoteCmd::new("cp")
            .arg("-a")
            .arg("/stage/dir with spaces")
            .arg("/opt/it's-here");

        assert_eq!(
            cmd.to_shell_string(),
            r"cp -a '/stage/dir with spaces' '/opt/it'\''s-here'"
        );
    }

    #[test]
    fn cwd_is_prepended_and_quoted() {
        let cmd = RemoteCmd::new("ls").arg("-l").cwd("/tmp/odd dir");
        assert_eq!(cmd.to_shell_string(), "cd '/tmp/odd dir' && ls -l");
    }

    #[test]
    fn shell_scripts_stay_one_argument() {
        let cmd = RemoteCmd::shell("rm -rf /opt/x && cp -a '/stage/x' /opt/x");
        assert_eq!(
            cmd.to_shell_string(),
            r"sh -c 'rm -rf /opt/x && cp -a '\''/stage/x'\'' /opt/x'"
        );
    }

    #[test]
    fn dollar_signs_survive_two_rounds() {
        // After one round of shell word-splitting/expansion the argument must come back
        // byte-identical: '$x y' expands to the literal `$x y`.
        let cmd = RemoteCmd::new("echo").arg("$x y");
        assert_eq!(cmd.to_shell_string(), "echo '$x y'");
    }
}
