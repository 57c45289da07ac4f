//! Remote execution agent.
//!
//! The agent reads `EXEC` and `EXIT` commands from a framed JSON channel and
//! runs each `EXEC` as a shell command, concurrently with the others. While
//! commands run, new output is streamed back as `TEXT` messages every
//! [`UPDATE_INTERVAL`]; a finished command is reported with one `RSLV`
//! message carrying the output that was not streamed yet. Finished commands
//! are collected in the background, so a slow one never holds up the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::channel::JsonChannel;
use crate::error::{AgentError, FutureError};
use crate::future::{ExecFuture, ExecOutput, RunningExec};

/// How often running commands are checked for output.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentCommand {
    #[serde(rename = "EXEC")]
    Exec {
        key: String,
        command: String,
        /// Seconds.
        #[serde(default)]
        timeout: Option<f64>,
    },
    #[serde(rename = "EXIT")]
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentReply {
    #[serde(rename = "TEXT")]
    Text {
        key: String,
        kind: OutputKind,
        text: String,
    },
    #[serde(rename = "RSLV")]
    Resolved {
        key: String,
        err: i32,
        stdout: String,
        stderr: String,
        timeout: bool,
    },
}

pub struct Agent<R, W> {
    channel: JsonChannel<R, W>,
    running: BTreeMap<String, RunningExec>,
    /// Commands that exited and are being collected.
    resolving: JoinSet<(String, Result<ExecOutput, FutureError>)>,
    resolving_keys: BTreeSet<String>,
}

impl<R, W> Agent<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            channel: JsonChannel::new(reader, writer),
            running: BTreeMap::new(),
            resolving: JoinSet::new(),
            resolving_keys: BTreeSet::new(),
        }
    }

    /// Serves commands until `EXIT` or the end of input. Commands still
    /// running at that point are killed.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let mut tick = tokio::time::interval(UPDATE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.channel.read_message() => {
                    let Some(message) = message? else {
                        tracing::debug!("input closed");
                        break;
                    };
                    let command = serde_json::from_value(message).map_err(AgentError::Message)?;
                    match command {
                        AgentCommand::Exec { key, command, timeout } => {
                            self.exec(key, command, timeout)?;
                        }
                        AgentCommand::Exit => break,
                    }
                }
                _ = tick.tick(), if !self.running.is_empty() => {
                    self.update().await?;
                }
                Some(joined) = self.resolving.join_next(), if !self.resolving.is_empty() => {
                    let (key, output) = joined?;
                    self.resolving_keys.remove(&key);
                    self.report(key, output?).await?;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn exec(&mut self, key: String, command: String, timeout: Option<f64>) -> Result<(), AgentError> {
        if self.running.contains_key(&key) || self.resolving_keys.contains(&key) {
            return Err(AgentError::DuplicateKey { key });
        }

        let mut future = ExecFuture::shell(command);
        if let Some(timeout) = timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        {
            future = future.set_timeout(timeout);
        }

        tracing::debug!(key = %key, command = %future.command_line(), "exec");
        self.running.insert(key, future.start()?);
        Ok(())
    }

    /// Streams new output, then hands every finished command over to be
    /// collected.
    async fn update(&mut self) -> Result<(), AgentError> {
        let mut finished = Vec::new();

        for (key, running) in self.running.iter_mut() {
            let (stdout, stderr) = running.read();
            for (kind, text) in [(OutputKind::Stdout, stdout), (OutputKind::Stderr, stderr)] {
                if text.is_empty() {
                    continue;
                }
                let reply = AgentReply::Text {
                    key: key.clone(),
                    kind,
                    text,
                };
                self.channel.write_message(&reply).await?;
            }
            if running.is_ready() {
                finished.push(key.clone());
            }
        }

        for key in finished {
            let Some(running) = self.running.remove(&key) else {
                continue;
            };
            self.resolving_keys.insert(key.clone());
            self.resolving.spawn(async move { (key, running.resolve().await) });
        }

        Ok(())
    }

    async fn report(&mut self, key: String, output: ExecOutput) -> Result<(), AgentError> {
        tracing::debug!(key = %key, status = output.status, timed_out = output.timed_out, "resolved");
        let reply = AgentReply::Resolved {
            key,
            err: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
            timeout: output.timed_out,
        };
        self.channel.write_message(&reply).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.resolving.shutdown().await;
        for (key, running) in std::mem::take(&mut self.running) {
            tracing::debug!(key = %key, "killing");
            if let Err(err) = running.resolve_kill().await {
                tracing::warn!(key = %key, "failed to kill command: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    use super::*;

    type Client = JsonChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn spawn_agent() -> (Client, JoinHandle<Result<(), AgentError>>) {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let agent = tokio::spawn(Agent::new(server_read, server_write).run());
        (JsonChannel::new(client_read, client_write), agent)
    }

    /// Reads replies for `key` until it is resolved, returning the full
    /// stdout and the final reply.
    async fn collect(client: &mut Client, key: &str) -> (String, AgentReply) {
        let mut streamed = String::new();
        loop {
            let reply: AgentReply = client.read().await.unwrap().unwrap();
            match &reply {
                AgentReply::Text { key: k, kind: OutputKind::Stdout, text } if k == key => {
                    streamed.push_str(text);
                }
                AgentReply::Resolved { key: k, stdout, .. } if k == key => {
                    streamed.push_str(stdout);
                    return (streamed, reply);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_wire_format() {
        let command: AgentCommand = serde_json::from_value(json!({
            "type": "EXEC",
            "key": "1",
            "command": "ls",
            "timeout": null,
        }))
        .unwrap();
        assert_eq!(
            command,
            AgentCommand::Exec {
                key: "1".into(),
                command: "ls".into(),
                timeout: None
            }
        );

        let reply = serde_json::to_value(AgentReply::Text {
            key: "1".into(),
            kind: OutputKind::Stderr,
            text: "oops".into(),
        })
        .unwrap();
        assert_eq!(
            reply,
            json!({ "type": "TEXT", "key": "1", "kind": "stderr", "text": "oops" })
        );
    }

    #[tokio::test]
    async fn test_exec_and_exit() {
        let (mut client, agent) = spawn_agent();

        client
            .write_message(&json!({ "type": "EXEC", "key": "a", "command": "echo one; sleep 0.2; echo two; exit 3" }))
            .await
            .unwrap();

        let (stdout, reply) = collect(&mut client, "a").await;
        assert_eq!(stdout, "one\ntwo\n");
        assert!(matches!(reply, AgentReply::Resolved { err: 3, timeout: false, .. }));

        client.write_message(&AgentCommand::Exit).await.unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commands_run_concurrently() {
        let (mut client, agent) = spawn_agent();

        let s = Instant::now();
        for key in ["a", "b"] {
            client
                .write_message(&json!({ "type": "EXEC", "key": key, "command": "sleep 0.3" }))
                .await
                .unwrap();
        }

        let mut done = 0;
        while done < 2 {
            let reply: AgentReply = client.read().await.unwrap().unwrap();
            if matches!(reply, AgentReply::Resolved { .. }) {
                done += 1;
            }
        }
        assert!(s.elapsed() < Duration::from_millis(550));

        drop(client);
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let (mut client, agent) = spawn_agent();

        client
            .write_message(&json!({ "type": "EXEC", "key": "t", "command": "exec sleep 5", "timeout": 0.1 }))
            .await
            .unwrap();

        let (_, reply) = collect(&mut client, "t").await;
        assert!(matches!(reply, AgentReply::Resolved { timeout: true, .. }));

        drop(client);
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_command_does_not_hold_up_others() {
        let (mut client, agent) = spawn_agent();

        client
            .write_message(&json!({ "type": "EXEC", "key": "slow", "command": "sleep 3; echo late", "timeout": 0.1 }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let s = Instant::now();
        client
            .write_message(&json!({ "type": "EXEC", "key": "fast", "command": "echo quick" }))
            .await
            .unwrap();

        let (stdout, _) = collect(&mut client, "fast").await;
        assert_eq!(stdout, "quick\n");
        assert!(s.elapsed() < Duration::from_secs(1), "took {:?}", s.elapsed());

        client.write_message(&AgentCommand::Exit).await.unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_background_output_does_not_freeze_agent() {
        let (mut client, agent) = spawn_agent();

        let s = Instant::now();
        for (key, command) in [("bg", "sleep 3 & echo started"), ("next", "sleep 0.2; echo done")] {
            client
                .write_message(&json!({ "type": "EXEC", "key": key, "command": command }))
                .await
                .unwrap();
        }

        let (stdout, reply) = collect(&mut client, "next").await;
        assert_eq!(stdout, "done\n");
        assert!(matches!(reply, AgentReply::Resolved { err: 0, .. }));
        assert!(s.elapsed() < Duration::from_secs(1), "took {:?}", s.elapsed());

        drop(client);
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_key_is_fatal() {
        let (mut client, agent) = spawn_agent();

        for _ in 0..2 {
            client
                .write_message(&json!({ "type": "EXEC", "key": "x", "command": "exec sleep 5" }))
                .await
                .unwrap();
        }

        let result = agent.await.unwrap();
        assert!(matches!(result, Err(AgentError::DuplicateKey { key }) if key == "x"));
    }

    #[tokio::test]
    async fn test_exit_kills_running_commands() {
        let (mut client, agent) = spawn_agent();

        let s = Instant::now();
        client
            .write_message(&json!({ "type": "EXEC", "key": "k", "command": "exec sleep 5" }))
            .await
            .unwrap();
        client.write_message(&AgentCommand::Exit).await.unwrap();

        agent.await.unwrap().unwrap();
        assert!(s.elapsed() < Duration::from_secs(2));
    }
}
