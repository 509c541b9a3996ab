use anyhow::{anyhow, Context, Result};
use ssh2::Session;
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use super::types::{ActionError, CommandOutput, Credential};

// libssh2 error code returned when a blocking call exceeds the session timeout.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Executes remote commands for one action run. The live SSH session is the
/// production implementation; tests substitute a scripted runner.
pub trait CommandRunner: Send {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, ActionError>;

    /// Runs commands in order, stopping at the first failure.
    fn run_batch(
        &mut self,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandOutput>, ActionError> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            outputs.push(self.run(command, timeout)?);
        }
        Ok(outputs)
    }
}

pub struct SshSession {
    session: Session,
}

/// Opens and authenticates one session. Host keys are not verified: managed
/// hosts are frequently freshly imaged, and a batch run must never stall on a
/// trust prompt.
pub fn connect(
    address: &str,
    port: u16,
    credential: &Credential,
    connect_timeout: Duration,
) -> Result<SshSession> {
    let addr = format!("{address}:{port}");
    let tcp = TcpStream::connect(&addr)
        .with_context(|| format!("Failed to open TCP connection to {addr}"))?;
    tcp.set_read_timeout(Some(connect_timeout)).ok();
    tcp.set_write_timeout(Some(connect_timeout)).ok();
    let control = tcp.try_clone().ok();

    let mut session = Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_pubkey_memory(&credential.username, None, &credential.private_key, None)
        .with_context(|| format!("SSH key authentication failed for {}", credential.username))?;
    if !session.authenticated() {
        return Err(anyhow!("SSH authentication failed"));
    }

    // Handshake is done; per-command timeouts take over from the socket ones.
    if let Some(control) = control {
        control.set_read_timeout(None).ok();
        control.set_write_timeout(None).ok();
    }

    Ok(SshSession { session })
}

impl SshSession {
    pub fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ActionError> {
        let timeout_seconds = timeout.as_secs();
        self.session
            .set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| classify_ssh_error(err, command, timeout_seconds))?;
        channel
            .exec(command)
            .map_err(|err| classify_ssh_error(err, command, timeout_seconds))?;

        let mut stdout = String::new();
        if let Err(err) = channel.read_to_string(&mut stdout) {
            return Err(classify_io_error(err, command, timeout_seconds));
        }
        let mut stderr = String::new();
        if let Err(err) = channel.stderr().read_to_string(&mut stderr) {
            return Err(classify_io_error(err, command, timeout_seconds));
        }
        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);

        let stdout = stdout.trim_end().to_string();
        let stderr = stderr.trim_end().to_string();
        if exit_code != 0 {
            return Err(ActionError::RemoteCommandFailed {
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
        })
    }
}

impl CommandRunner for SshSession {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, ActionError> {
        self.execute(command, timeout)
    }
}

fn classify_ssh_error(err: ssh2::Error, command: &str, timeout_seconds: u64) -> ActionError {
    if matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
        return ActionError::RemoteCommandTimedOut {
            command: command.to_string(),
            timeout_seconds,
        };
    }
    anyhow::Error::new(err)
        .context(format!("SSH channel error while running {command}"))
        .into()
}

fn classify_io_error(err: std::io::Error, command: &str, timeout_seconds: u64) -> ActionError {
    if matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) {
        return ActionError::RemoteCommandTimedOut {
            command: command.to_string(),
            timeout_seconds,
        };
    }
    anyhow::Error::new(err)
        .context(format!("Failed to read output of {command}"))
        .into()
}

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn io_timeouts_map_to_timed_out() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        match classify_io_error(err, "sleep 99", 5) {
            ActionError::RemoteCommandTimedOut {
                command,
                timeout_seconds,
            } => {
                assert_eq!(command, "sleep 99");
                assert_eq!(timeout_seconds, 5);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn other_io_errors_stay_infrastructure_errors() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        match classify_io_error(err, "uname -a", 5) {
            ActionError::Other(err) => {
                assert!(err.to_string().contains("uname -a"));
            }
            other => panic!("expected infrastructure error, got {other:?}"),
        }
    }

    #[test]
    fn batch_stops_at_the_first_failure() {
        let mut runner = crate::test_support::ScriptedRunner::new().fail_on(2, "boom");
        let commands = vec![
            "uname -s".to_string(),
            "false".to_string(),
            "echo after".to_string(),
        ];
        let err = runner
            .run_batch(&commands, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ActionError::RemoteCommandFailed { .. }));
        assert_eq!(runner.commands, vec!["uname -s", "false"]);
    }

    #[test]
    fn batch_returns_every_output_in_order() {
        let mut runner = crate::test_support::ScriptedRunner::new();
        let commands = vec!["uname -s".to_string(), "id -u".to_string()];
        let outputs = runner.run_batch(&commands, Duration::from_secs(5)).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].command, "uname -s");
        assert_eq!(outputs[1].command, "id -u");
    }
}
