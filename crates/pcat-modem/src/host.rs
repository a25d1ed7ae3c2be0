//! Host-side commands: the radio kill switch and the toggle between the
//! built-in modem management path and an external dial helper.

use std::process::Command;

use pcat_common::config::HostConfig;

use crate::error::{ModemError, Result};

/// Host operations the controller invokes but does not implement itself.
pub trait HostControl: Send + Sync {
    /// `rfkill block wwan` / `rfkill unblock wwan`.
    fn set_radio_blocked(&self, blocked: bool) -> Result<()>;

    /// Enable or disable the built-in modem management path.
    fn set_builtin_management(&self, enabled: bool) -> Result<()>;

    /// Whether the host already runs its own modem management service.
    fn native_manager_present(&self) -> bool;
}

/// [`HostControl`] backed by external commands.
pub struct CommandHost {
    config: HostConfig,
}

impl CommandHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

fn run_command(argv: &[String]) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ModemError::ConfigMissing("host command"));
    };
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| ModemError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !status.success() {
        return Err(ModemError::Io(std::io::Error::other(format!(
            "{program} exited with {status}"
        ))));
    }
    Ok(())
}

impl HostControl for CommandHost {
    fn set_radio_blocked(&self, blocked: bool) -> Result<()> {
        let action = if blocked { "block" } else { "unblock" };
        run_command(&["rfkill".into(), action.into(), "wwan".into()])
    }

    fn set_builtin_management(&self, enabled: bool) -> Result<()> {
        if enabled {
            run_command(&self.config.builtin_enable_cmd)
        } else {
            run_command(&self.config.builtin_disable_cmd)
        }
    }

    fn native_manager_present(&self) -> bool {
        self.config
            .native_manager_marker
            .as_ref()
            .is_some_and(|path| path.exists())
    }
}
