use std::fmt;

use envforge_core::RunAs;

/// Variables every module command receives.
pub const ENV_TARGET_USER: &str = "ENVFORGE_TARGET_USER";
pub const ENV_WORKSPACE_ROOT: &str = "ENVFORGE_WORKSPACE_ROOT";
pub const ENV_MODULE: &str = "ENVFORGE_MODULE";

const PRESERVED_ENV: &str = "--preserve-env=ENVFORGE_TARGET_USER,ENVFORGE_WORKSPACE_ROOT,ENVFORGE_MODULE";

/// Who the orchestrator itself is running as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionIdentity {
    pub euid: u32,
    pub user: Option<String>,
}

impl ExecutionIdentity {
    pub fn current() -> Self {
        Self {
            euid: effective_uid(),
            user: std::env::var("USER").ok().filter(|value| !value.is_empty()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    fn is_user(&self, user: &str) -> bool {
        !self.is_root() && self.user.as_deref() == Some(user)
    }
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Maps a shell command onto the process invocation for its execution context.
pub fn wrap_for_context(
    run_as: RunAs,
    command: &str,
    target_user: &str,
    identity: &ExecutionIdentity,
) -> CommandLine {
    match run_as {
        RunAs::Root if identity.is_root() => CommandLine::new("bash", &["-c", command]),
        RunAs::Root => CommandLine::new("sudo", &["-n", PRESERVED_ENV, "bash", "-c", command]),
        RunAs::TargetUser if identity.is_user(target_user) => {
            CommandLine::new("bash", &["-lc", command])
        }
        RunAs::TargetUser => CommandLine::new(
            "sudo",
            &["-n", PRESERVED_ENV, "-u", target_user, "-H", "bash", "-lc", command],
        ),
        RunAs::TargetUserNoShell if identity.is_user(target_user) => {
            CommandLine::new("bash", &["-c", command])
        }
        RunAs::TargetUserNoShell => CommandLine::new(
            "sudo",
            &["-n", PRESERVED_ENV, "-u", target_user, "-H", "bash", "-c", command],
        ),
        RunAs::InvokingUser => CommandLine::new("bash", &["-c", command]),
    }
}

pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | '=' | ':' | ','));
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
