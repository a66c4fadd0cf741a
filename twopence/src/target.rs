//! The public entry point for this crate (§4.8, §6): a connected
//! `<plugin>:<spec>` target, wrapping a [`PluginHandle`] with the defaults
//! (user, timeout, file mode, environment) a caller otherwise has to repeat
//! on every call. Grounded on `monocoque/src/zmq/socket.rs`'s socket façade
//! — a thin public wrapper around the sans-IO connection it owns, with
//! constructor-time target parsing standing in for that type's address
//! parsing.

use std::time::Duration;

use bytes::Bytes;

use twopence_core::config::TargetDefaults;
use twopence_core::environment::Environment;
use twopence_core::error::{Result, TwopenceError};
use twopence_protocol::{Command, FileTransfer, Status};

use crate::plugins::{PluginHandle, PluginId};

/// A connected test target: `<plugin>:<spec>`, e.g. `"ssh:root@10.0.0.5"`,
/// `"virtio:/var/run/monitor.sock"`, or `"local:"`.
///
/// Carries the defaults applied to every command run through it, the way
/// the original library's `target_command_run` filled in a handle's
/// `target->options` when a caller left them unset.
pub struct Target {
    handle: PluginHandle,
    defaults: TargetDefaults,
    environment: Environment,
}

impl Target {
    /// Parse `spec` as `<plugin>:<rest>` and connect, e.g.
    /// `Target::connect("local:").await` or
    /// `Target::connect("tcp:127.0.0.1:9999").await`.
    pub async fn connect(spec: &str) -> Result<Self> {
        let (plugin, rest) = spec
            .split_once(':')
            .ok_or_else(|| TwopenceError::invalid_target(format!("missing ':' in target spec: {spec}")))?;
        let id = PluginId::parse(plugin)?;
        let handle = PluginHandle::connect(id, rest).await?;
        Ok(Self {
            handle,
            defaults: TargetDefaults::default(),
            environment: Environment::new(),
        })
    }

    /// The target's default environment, merged as inferior (never
    /// overriding) into every command's own environment before it's sent.
    #[must_use]
    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    /// Override the user a bare command runs as when it doesn't specify
    /// its own. Defaults to `"root"`, matching the original library.
    pub fn set_default_user(&mut self, user: impl Into<String>) {
        self.defaults.user = user.into();
    }

    /// Override the timeout a bare command runs under when it doesn't
    /// specify its own. Defaults to 60 seconds.
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.defaults.timeout = timeout;
    }

    /// Override the file mode applied to a bare injected file. Defaults to
    /// `0o644`.
    pub fn set_default_file_mode(&mut self, mode: u32) {
        self.defaults.file_mode = mode;
    }

    fn apply_defaults(&self, mut command: Command) -> (Command, Duration) {
        if command.user.is_none() {
            command.user = Some(self.defaults.user.clone());
        }
        let timeout = command.timeout.unwrap_or(self.defaults.timeout);
        command.environment.merge_inferior(&self.environment);
        (command, timeout)
    }

    /// §4.8 `run_test`: run `command` to completion (or until it times out
    /// or is canceled) and collect its stdout, stderr, and exit status.
    pub async fn run_test(&mut self, command: Command) -> Result<Status> {
        let (command, timeout) = self.apply_defaults(command);
        self.handle.run_test(command, timeout).await
    }

    /// §4.8 `inject_file`: push a local file to the target. `xfer.mode`
    /// defaults to this target's default file mode (0o644 unless overridden
    /// via [`Target::set_default_file_mode`]) when the caller built `xfer`
    /// with [`FileTransfer::inject_default_mode`] or [`FileTransfer::extract`]
    /// and never set an explicit mode.
    pub async fn inject_file(&mut self, mut xfer: FileTransfer, timeout: Option<Duration>) -> Result<Status> {
        if xfer.mode.is_none() {
            xfer.mode = Some(self.defaults.file_mode);
        }
        let timeout = timeout.unwrap_or(self.defaults.timeout);
        self.handle.inject_file(xfer, timeout).await
    }

    /// §4.8 `extract_file`: pull a remote file to a local path.
    pub async fn extract_file(&mut self, xfer: FileTransfer, timeout: Option<Duration>) -> Result<Status> {
        let timeout = timeout.unwrap_or(self.defaults.timeout);
        self.handle.extract_file(xfer, timeout).await
    }

    /// §4.8 `chat_begin`: start an interactive command; returns the
    /// session's transaction id and the remote child's pid. Use the
    /// returned id with [`Target::chat_write`], [`Target::chat_expect`],
    /// [`Target::chat_gets`], and [`Target::chat_wait`].
    pub async fn chat_begin(&mut self, command: Command) -> Result<(u16, u32)> {
        let (command, timeout) = self.apply_defaults(command);
        self.handle.chat_begin(command, timeout).await
    }

    /// §4.8 `chat_write`/`chat_puts`: send more bytes to a chat session's
    /// stdin.
    pub fn chat_write(&mut self, xid: u16, data: impl Into<Bytes>) -> Result<()> {
        self.handle.chat_write(xid, data.into())
    }

    /// Close a chat session's stdin without waiting for it to end.
    pub fn chat_close_stdin(&mut self, xid: u16) {
        self.handle.chat_close_stdin(xid);
    }

    /// §4.8 `chat_expect`: block until any of `patterns` appears in the
    /// session's output (earliest occurrence wins a tie in favor of the
    /// longer pattern), or `timeout` elapses.
    pub async fn chat_expect(&mut self, xid: u16, patterns: &[String], timeout: Duration) -> Result<String> {
        self.handle.chat_expect(xid, patterns, timeout).await
    }

    /// §4.8 `chat_gets`: read the next line from a chat session's output.
    pub async fn chat_gets(&mut self, xid: u16, timeout: Duration) -> Result<String> {
        self.handle.chat_gets(xid, timeout).await
    }

    /// Close a chat session's stdin and wait for the underlying command to
    /// exit, returning its final status.
    pub async fn chat_wait(&mut self, xid: u16) -> Result<Status> {
        self.handle.chat_wait(xid).await
    }

    /// §4.8 `interrupt_command`: ask the target to send the running
    /// command an interrupt signal (SIGINT-equivalent), best-effort.
    pub async fn interrupt_command(&mut self) -> Result<()> {
        self.handle.interrupt_command().await
    }

    /// Cancel every transaction currently in flight on this target,
    /// completing each with [`twopence_core::error::TwopenceError::CommandCanceled`].
    pub async fn cancel_transactions(&mut self) {
        self.handle.cancel_transactions().await;
    }

    /// §4.8 `disconnect`: send `QUIT` and tear down the transport. The
    /// target is unusable afterward; drop it.
    pub async fn disconnect(mut self) {
        self.handle.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn connect_rejects_a_spec_with_no_plugin_separator() {
        let err = Target::connect("no-colon-here").await.unwrap_err();
        assert!(matches!(err, TwopenceError::InvalidTarget(_)));
    }

    #[compio::test]
    async fn connect_rejects_an_unknown_plugin() {
        let err = Target::connect("bogus:whatever").await.unwrap_err();
        assert!(matches!(err, TwopenceError::UnknownPlugin(_)));
    }

    #[compio::test]
    async fn connect_to_local_and_run_a_command() {
        let mut target = Target::connect("local:").await.unwrap();
        let status = target.run_test(Command::new("echo hello")).await.unwrap();
        assert_eq!(status.major, 0);
        target.disconnect().await;
    }

    #[compio::test]
    async fn stub_plugin_reports_unsupported_function() {
        let mut target = Target::connect("ssh:root@example.invalid").await.unwrap();
        let err = target.run_test(Command::new("true")).await.unwrap_err();
        assert!(matches!(err, TwopenceError::UnsupportedFunction(_)));
    }
}
