//! External hook program invocation.
//!
//! The operator-supplied `run_program` is called with one action word and
//! optional arguments on lifecycle transitions. `start_group` and
//! `stop_group` are gated so they always alternate.

use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Started,
    Terminated,
    StartGroup,
    StopGroup,
    Connect,
    Disconnect,
}

impl HookAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookAction::Started => "started",
            HookAction::Terminated => "terminated",
            HookAction::StartGroup => "start_group",
            HookAction::StopGroup => "stop_group",
            HookAction::Connect => "connect",
            HookAction::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Default)]
pub struct HookRunner {
    program: Option<String>,
    /// Set after `start_group` fired; `stop_group` only fires while set.
    group_started: bool,
    /// Invocation log kept for tests; command lines that were run.
    #[cfg(test)]
    pub trace: Vec<String>,
}

impl HookRunner {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program,
            ..Default::default()
        }
    }

    pub fn set_program(&mut self, program: Option<String>) {
        self.program = program;
    }

    /// Run the hook for `action`. Returns whether it was invoked (the
    /// alternation gate may suppress it).
    pub async fn run(&mut self, action: HookAction, args: &[&str]) -> bool {
        let Some(program) = self.program.clone() else {
            return false;
        };
        match action {
            HookAction::StartGroup => {
                if self.group_started {
                    return false;
                }
                self.group_started = true;
            }
            HookAction::StopGroup => {
                if !self.group_started {
                    return false;
                }
                self.group_started = false;
            }
            _ => {}
        }
        let mut command_line = format!("{program} {}", action.as_str());
        for arg in args {
            command_line.push(' ');
            command_line.push_str(arg);
        }
        #[cfg(test)]
        self.trace.push(command_line.clone());
        debug!("running hook: {command_line}");
        match Command::new("sh").arg("-c").arg(&command_line).status().await {
            Ok(status) => {
                debug!("hook {} completed with {status}", action.as_str());
                true
            }
            Err(e) => {
                warn!("hook {command_line:?} failed to run: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_alternate() {
        let mut hooks = HookRunner::new(Some("true".to_string()));
        assert!(hooks.run(HookAction::StartGroup, &[]).await);
        assert!(!hooks.run(HookAction::StartGroup, &[]).await);
        assert!(hooks.run(HookAction::StopGroup, &[]).await);
        assert!(!hooks.run(HookAction::StopGroup, &[]).await);
        assert!(hooks.run(HookAction::StartGroup, &[]).await);
    }

    #[tokio::test]
    async fn no_program_means_no_invocation() {
        let mut hooks = HookRunner::new(None);
        assert!(!hooks.run(HookAction::Started, &["x"]).await);
        assert!(hooks.trace.is_empty());
    }

    #[tokio::test]
    async fn arguments_are_appended() {
        let mut hooks = HookRunner::new(Some("true".to_string()));
        hooks
            .run(HookAction::Connect, &["aa:bb:cc:dd:ee:ff", "phone", "p2p-wlan0-0"])
            .await;
        assert_eq!(
            hooks.trace,
            vec!["true connect aa:bb:cc:dd:ee:ff phone p2p-wlan0-0".to_string()]
        );
    }
}
