use std::{
    ffi::{OsStr, OsString},
    process::Command as StdCommand,
};

use anyhow::{Context, Error};
use log::trace;
use strum_macros::IntoStaticStr;

use crate::exe::OutputChecker;

/// External tools the service invokes on the host. Binaries are resolved via
/// `PATH` at spawn time, so tests can shadow them with fakes.
#[derive(Debug, Clone, Copy, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    /// Namespace-entry helper used to run tools in the host namespaces.
    Nsenter,
    #[strum(serialize = "sonic-installer")]
    SonicInstaller,
    // Test dependencies
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
    #[cfg(test)]
    DoesNotExist,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Nsenter => "nsenter"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        which::which(self.name()).is_ok()
    }

    /// Converts the dependency to a new command builder
    pub fn cmd(&self) -> HostCommand {
        HostCommand {
            dependency: *self,
            args: vec![],
        }
    }
}

/// Command builder for a host tool invocation.
pub struct HostCommand {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl HostCommand {
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    fn render(&self) -> String {
        let mut rendered = self.dependency.name().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }

    /// Runs the command, capturing all output.
    pub fn output(self) -> Result<std::process::Output, Error> {
        let rendered = self.render();
        trace!("Executing '{rendered}'");
        StdCommand::new(self.dependency.name())
            .args(&self.args)
            .output()
            .context(format!("Failed to execute '{rendered}'"))
    }

    /// Runs the command and fails on a non-zero exit, discarding output.
    pub fn run_and_check(self) -> Result<(), Error> {
        let rendered = self.render();
        self.output()?
            .check()
            .context(format!("'{rendered}' finished unsuccessfully"))
    }

    /// Runs the command, fails on a non-zero exit and returns stdout.
    pub fn output_and_check(self) -> Result<String, Error> {
        let rendered = self.render();
        self.output()?
            .check_output()
            .context(format!("'{rendered}' finished unsuccessfully"))
    }
}
