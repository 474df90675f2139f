//! Remote shell execution.
//!
//! A command runs inside a remote shell that moves through
//! `Uncreated -> Created -> Running -> Terminated -> Deleted`:
//!
//! 1. `create` opens the shell and returns its id.
//! 2. `command` starts the command line and returns a command id.
//! 3. `receive` is polled until the command reports an exit code.
//! 4. `signal` terminates the command, `delete` releases the shell.
//!
//! [`SingleCommandClient`] runs the whole cycle under one session permit.
//! [`LongCommandClient`] keeps the shell open between calls so output can
//! be polled incrementally.

pub mod command_line;

pub use command_line::{build_command_line_elem, build_ps_command_line_elem, split_command_line};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::WinRmClient;
use crate::config::ConnectionInfo;
use crate::error::{Error, Result};
use crate::response::{Element, SHELL_NS, WSMAN_NS};
use crate::session::{RequestSender, Session, SessionKey};

pub const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
pub const SIGNAL_CTRL_C: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/ctrl_c";

// ============================================================================
// Command Response
// ============================================================================

/// Output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    /// Non-empty, trimmed stdout lines
    pub stdout: Vec<String>,
    /// Non-empty, trimmed stderr lines
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
}

/// Decoded output of one `receive` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// Split decoded stream bytes into non-empty trimmed lines.
pub fn stripped_lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Response Extraction
// ============================================================================

pub fn find_shell_id(root: &Element) -> Result<String> {
    root.find_all(WSMAN_NS, "Selector")
        .find(|selector| selector.attr("Name") == Some("ShellId"))
        .map(|selector| selector.trimmed_text().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::protocol("Shell id missing from create response"))
}

pub fn find_command_id(root: &Element) -> Result<String> {
    root.find_text(SHELL_NS, "CommandId")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::protocol("Command id missing from command response"))
}

/// Concatenated, base64-decoded content of the `stream_name` streams of
/// `command_id`.
pub fn find_stream(root: &Element, command_id: &str, stream_name: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for stream in root.find_all(SHELL_NS, "Stream").filter(|stream| {
        stream.attr("Name") == Some(stream_name) && stream.attr("CommandId") == Some(command_id)
    }) {
        let text = stream.trimmed_text();
        if text.is_empty() {
            continue;
        }
        let decoded = BASE64_STANDARD
            .decode(text)
            .map_err(|e| Error::protocol(format!("Invalid {} stream encoding: {}", stream_name, e)))?;
        data.extend_from_slice(&decoded);
    }
    Ok(data)
}

/// Exit code of `command_id`, once the command has finished.
pub fn find_exit_code(root: &Element, command_id: &str) -> Result<Option<i32>> {
    let Some(state) = root
        .find_all(SHELL_NS, "CommandState")
        .find(|state| state.attr("CommandId") == Some(command_id))
    else {
        return Ok(None);
    };
    state
        .find_text(SHELL_NS, "ExitCode")
        .map(|code| {
            code.parse::<i32>()
                .map_err(|e| Error::protocol(format!("Invalid exit code '{}': {}", code, e)))
        })
        .transpose()
}

// ============================================================================
// Shell State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Uncreated,
    Created,
    Running,
    Terminated,
    Deleted,
}

impl fmt::Display for ShellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One remote shell and the command running in it.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    state: ShellState,
    shell_id: Option<String>,
    command_id: Option<String>,
    exit_code: Option<i32>,
}

impl Default for RemoteShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteShell {
    pub fn new() -> Self {
        Self {
            state: ShellState::Uncreated,
            shell_id: None,
            command_id: None,
            exit_code: None,
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    pub fn shell_id(&self) -> Option<&str> {
        self.shell_id.as_deref()
    }

    pub fn command_id(&self) -> Option<&str> {
        self.command_id.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn expect_state(&self, operation: &str, allowed: &[ShellState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "Cannot {} a shell in state {}",
                operation, self.state
            )))
        }
    }

    fn ids(&self) -> Result<(&str, &str)> {
        match (&self.shell_id, &self.command_id) {
            (Some(shell_id), Some(command_id)) => Ok((shell_id, command_id)),
            _ => Err(Error::protocol("Shell has no running command")),
        }
    }

    pub async fn create(&mut self, sender: &RequestSender) -> Result<&str> {
        self.expect_state("create", &[ShellState::Uncreated])?;
        let body = sender.send("create", &[]).await?.bytes().await?;
        let shell_id = find_shell_id(&Element::parse(&body)?)?;
        debug!(shell_id = %shell_id, "Created shell");
        self.state = ShellState::Created;
        Ok(self.shell_id.insert(shell_id).as_str())
    }

    /// Start a command. `command_line_elem` is an `rsp:CommandLine` element
    /// built by [`build_command_line_elem`] or
    /// [`build_ps_command_line_elem`].
    pub async fn run(
        &mut self,
        sender: &RequestSender,
        command_line_elem: &str,
        timeout_secs: u64,
    ) -> Result<&str> {
        self.expect_state("run a command in", &[ShellState::Created])?;
        let shell_id = self
            .shell_id
            .as_deref()
            .ok_or_else(|| Error::protocol("Shell id missing"))?;
        let timeout = timeout_secs.to_string();
        let body = sender
            .send(
                "command",
                &[
                    ("shell_id", shell_id),
                    ("command_line_elem", command_line_elem),
                    ("timeout", timeout.as_str()),
                ],
            )
            .await?
            .bytes()
            .await?;
        let command_id = find_command_id(&Element::parse(&body)?)?;
        debug!(shell_id, command_id = %command_id, "Started command");
        self.state = ShellState::Running;
        Ok(self.command_id.insert(command_id).as_str())
    }

    /// Poll once for output.
    pub async fn receive(&mut self, sender: &RequestSender) -> Result<ReceiveOutput> {
        self.expect_state("receive from", &[ShellState::Running])?;
        let (shell_id, command_id) = self.ids()?;
        let body = sender
            .send("receive", &[("shell_id", shell_id), ("command_id", command_id)])
            .await?
            .bytes()
            .await?;
        let root = Element::parse(&body)?;
        let output = ReceiveOutput {
            stdout: find_stream(&root, command_id, "stdout")?,
            stderr: find_stream(&root, command_id, "stderr")?,
            exit_code: find_exit_code(&root, command_id)?,
        };
        if output.exit_code.is_some() {
            self.exit_code = output.exit_code;
        }
        Ok(output)
    }

    /// Send a signal to the running command. Terminate ends the command;
    /// Ctrl-C leaves it running until the server reports completion.
    pub async fn signal(&mut self, sender: &RequestSender, signal_code: &str) -> Result<()> {
        self.expect_state("signal", &[ShellState::Running])?;
        let (shell_id, command_id) = self.ids()?;
        sender
            .send(
                "signal",
                &[
                    ("shell_id", shell_id),
                    ("command_id", command_id),
                    ("signal_code", signal_code),
                ],
            )
            .await?;
        if signal_code == SIGNAL_TERMINATE {
            self.state = ShellState::Terminated;
        }
        Ok(())
    }

    pub async fn delete(&mut self, sender: &RequestSender) -> Result<()> {
        self.expect_state(
            "delete",
            &[ShellState::Created, ShellState::Running, ShellState::Terminated],
        )?;
        let shell_id = self
            .shell_id
            .as_deref()
            .ok_or_else(|| Error::protocol("Shell id missing"))?;
        sender.send("delete", &[("shell_id", shell_id)]).await?;
        debug!(shell_id, "Deleted shell");
        self.state = ShellState::Deleted;
        Ok(())
    }
}

/// Best-effort delete of a shell after `error`; returns `error`.
async fn discard(shell: &mut RemoteShell, sender: &RequestSender, error: Error) -> Error {
    if let Err(delete_error) = shell.delete(sender).await {
        warn!(
            shell_id = shell.shell_id().unwrap_or_default(),
            error = %delete_error,
            "Failed to delete shell"
        );
    }
    error
}

fn command_line_elem(command_line: &str, ps_script: Option<&str>) -> Result<String> {
    match ps_script {
        Some(script) => build_ps_command_line_elem(command_line, script),
        None => build_command_line_elem(command_line),
    }
}

// ============================================================================
// Single Command Client
// ============================================================================

/// Runs one command to completion, like `winrs`.
#[derive(Debug, Clone)]
pub struct SingleCommandClient {
    client: WinRmClient,
    conn_info: Arc<ConnectionInfo>,
    key: SessionKey,
}

impl SingleCommandClient {
    pub(crate) fn new(client: WinRmClient, conn_info: Arc<ConnectionInfo>) -> Self {
        let key = SessionKey::short(conn_info.address());
        Self {
            client,
            conn_info,
            key,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Run `command_line`, or a PowerShell script when `ps_script` is given
    /// (e.g. `powershell -NoLogo -NonInteractive -NoProfile -Command` with
    /// `"& {Get-Counter ...}"`).
    ///
    /// Returns `None` when the command timed out; the shell is still
    /// deleted in that case.
    pub async fn run_command(
        &self,
        command_line: &str,
        ps_script: Option<&str>,
    ) -> Result<Option<CommandResponse>> {
        let elem = command_line_elem(command_line, ps_script)?;
        let session = self
            .client
            .sessions()
            .get_or_create(self.key.clone(), &self.conn_info);

        let result = self.run_in_session(&session, command_line, &elem).await;
        session.close();
        result
    }

    async fn run_in_session(
        &self,
        session: &Arc<Session>,
        command_line: &str,
        elem: &str,
    ) -> Result<Option<CommandResponse>> {
        let sender = session.acquire().await?;
        let mut shell = RemoteShell::new();
        shell.create(&sender).await?;
        info!(host = %self.conn_info.hostname, command_line, "Running command");

        let response = match self.run_to_completion(&sender, &mut shell, elem).await {
            Ok(response) => Some(response),
            Err(e) if e.is_timeout() => {
                warn!(host = %self.conn_info.hostname, command_line, "Command timed out");
                None
            }
            Err(e) => return Err(discard(&mut shell, &sender, e).await),
        };

        shell.delete(&sender).await?;
        Ok(response)
    }

    async fn run_to_completion(
        &self,
        sender: &RequestSender,
        shell: &mut RemoteShell,
        elem: &str,
    ) -> Result<CommandResponse> {
        shell.run(sender, elem, self.conn_info.timeout).await?;

        let limit = self.client.config().max_requests_per_command;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        for _ in 0..limit {
            let output = shell.receive(sender).await?;
            stdout.extend_from_slice(&output.stdout);
            stderr.extend_from_slice(&output.stderr);
            if output.exit_code.is_some() {
                exit_code = output.exit_code;
                break;
            }
        }
        if exit_code.is_none() {
            return Err(Error::MaxIterationsExceeded {
                operation: "command",
                limit,
            });
        }

        shell.signal(sender, SIGNAL_TERMINATE).await?;
        Ok(CommandResponse {
            stdout: stripped_lines(&stdout),
            stderr: stripped_lines(&stderr),
            exit_code,
        })
    }
}

// ============================================================================
// Long Command Client
// ============================================================================

/// Runs a long-lived command (e.g. `typeperf -si 1`) and polls its output.
///
/// Each command line gets its own session key, so several long-running
/// commands on one host do not block each other or short conversations.
#[derive(Debug)]
pub struct LongCommandClient {
    client: WinRmClient,
    conn_info: Arc<ConnectionInfo>,
    running: Option<(Arc<Session>, RemoteShell)>,
}

impl LongCommandClient {
    pub(crate) fn new(client: WinRmClient, conn_info: Arc<ConnectionInfo>) -> Self {
        Self {
            client,
            conn_info,
            running: None,
        }
    }

    /// Session key for a command line and optional script.
    pub fn key_for(&self, command_line: &str, ps_script: Option<&str>) -> SessionKey {
        SessionKey::new(
            self.conn_info.address(),
            format!("{}{}", command_line, ps_script.unwrap_or_default()),
        )
    }

    pub fn shell(&self) -> Option<&RemoteShell> {
        self.running.as_ref().map(|(_, shell)| shell)
    }

    /// Create a shell and start the command.
    pub async fn start(&mut self, command_line: &str, ps_script: Option<&str>) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::protocol("A command is already running"));
        }
        let elem = command_line_elem(command_line, ps_script)?;
        let key = self.key_for(command_line, ps_script);
        let session = self.client.sessions().get_or_create(key, &self.conn_info);
        info!(host = %self.conn_info.hostname, command_line, "Starting long-running command");

        let sender = session.acquire().await?;
        let mut shell = RemoteShell::new();
        shell.create(&sender).await?;
        if let Err(e) = shell.run(&sender, &elem, self.conn_info.timeout).await {
            let e = discard(&mut shell, &sender, e).await;
            drop(sender);
            session.close();
            return Err(e);
        }
        drop(sender);
        self.running = Some((session, shell));
        Ok(())
    }

    /// Poll once, returning the stdout and stderr lines received so far.
    pub async fn receive(&mut self) -> Result<(Vec<String>, Vec<String>)> {
        let (session, shell) = self
            .running
            .as_mut()
            .ok_or_else(|| Error::protocol("No command has been started"))?;
        let sender = session.acquire().await?;
        let output = match shell.receive(&sender).await {
            Ok(output) => output,
            Err(e) => {
                drop(sender);
                if e.is_timeout() {
                    session.close();
                }
                return Err(e);
            }
        };
        Ok((stripped_lines(&output.stdout), stripped_lines(&output.stderr)))
    }

    /// Interrupt the command, collect its trailing output and delete the
    /// shell. `close` also schedules the session's idle close.
    ///
    /// The shell is deleted even when interrupting fails. It is only
    /// forgotten once the delete succeeds, so a failed `stop` can be
    /// retried.
    pub async fn stop(&mut self, close: bool) -> Result<CommandResponse> {
        let (session, shell) = self
            .running
            .as_mut()
            .ok_or_else(|| Error::protocol("No command has been started"))?;
        let session = Arc::clone(session);

        let sender = session.acquire().await?;
        let interrupted = interrupt(&sender, shell, &self.conn_info.hostname).await;
        let deleted = shell.delete(&sender).await;
        let exit_code = shell.exit_code();
        drop(sender);

        let (stdout, stderr) = match (interrupted, deleted) {
            (Ok(lines), Ok(())) => lines,
            (Err(e), Ok(())) => {
                self.running = None;
                session.close();
                return Err(e);
            }
            (interrupted, Err(delete_error)) => {
                warn!(
                    host = %self.conn_info.hostname,
                    error = %delete_error,
                    "Failed to delete shell"
                );
                return Err(interrupted.err().unwrap_or(delete_error));
            }
        };

        self.running = None;
        if close {
            session.close();
        }
        Ok(CommandResponse {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Ctrl-C, collect trailing output, terminate. A shell that is no longer
/// running has nothing left to interrupt.
async fn interrupt(
    sender: &RequestSender,
    shell: &mut RemoteShell,
    host: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    if shell.state() != ShellState::Running {
        return Ok((Vec::new(), Vec::new()));
    }
    shell.signal(sender, SIGNAL_CTRL_C).await?;
    let lines = match shell.receive(sender).await {
        Ok(output) => (stripped_lines(&output.stdout), stripped_lines(&output.stderr)),
        Err(e) if e.is_timeout() => {
            debug!(host, "Timed out collecting trailing output");
            (Vec::new(), Vec::new())
        }
        Err(e) => return Err(e),
    };
    shell.signal(sender, SIGNAL_TERMINATE).await?;
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RECEIVE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
        xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
      <s:Body>
        <rsp:ReceiveResponse>
          <rsp:Stream Name="stdout" CommandId="C1">aGVsbG8K</rsp:Stream>
          <rsp:Stream Name="stdout" CommandId="C2">b3RoZXIK</rsp:Stream>
          <rsp:Stream Name="stdout" CommandId="C1">d29ybGQ=</rsp:Stream>
          <rsp:Stream Name="stderr" CommandId="C1" End="true"></rsp:Stream>
          <rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
            <rsp:ExitCode>3</rsp:ExitCode>
          </rsp:CommandState>
        </rsp:ReceiveResponse>
      </s:Body>
    </s:Envelope>"#;

    #[test]
    fn test_find_stream_filters_by_command() {
        let root = Element::parse(RECEIVE.as_bytes()).unwrap();
        assert_eq!(find_stream(&root, "C1", "stdout").unwrap(), b"hello\nworld");
        assert!(find_stream(&root, "C1", "stderr").unwrap().is_empty());
        assert_eq!(find_exit_code(&root, "C1").unwrap(), Some(3));
        assert_eq!(find_exit_code(&root, "C2").unwrap(), None);
    }

    #[test]
    fn test_stripped_lines() {
        let joined = [&b"foo\nbar"[..], b"quux blah\n", b"\nblam bloo", b"flim flam floo"].concat();
        assert_eq!(
            stripped_lines(&joined),
            vec!["foo", "barquux blah", "blam blooflim flam floo"]
        );
        assert!(stripped_lines(b"\r\n  \r\n").is_empty());
    }

    #[test]
    fn test_missing_shell_id() {
        let root = Element::parse(b"<a xmlns='urn:x'><b/></a>").unwrap();
        assert!(matches!(find_shell_id(&root), Err(Error::ProtocolState(_))));
        assert!(find_command_id(&root).is_err());
    }

    #[test]
    fn test_shell_state_guards() {
        let shell = RemoteShell::new();
        assert_eq!(shell.state(), ShellState::Uncreated);
        assert!(shell.expect_state("signal", &[ShellState::Running]).is_err());
        assert!(shell.ids().is_err());
    }
}
