//! Console channel — reads lines from stdin, dispatches slash commands and
//! control requests, writes replies to stdout.
//!
//! Lines starting with `/` are executed in the configured namespace as the
//! configured actor. Lines starting with `:` go to the control plane:
//!
//! ```text
//! :status            uptime, extension and registration counts
//! :extensions        every extension with its state
//! :commands          commands visible in the console namespace
//! :disable <id>      deactivate an extension
//! :quit              shut the host down
//! ```
//!
//! Runs until `shutdown` is cancelled, stdin closes, or `:quit`.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::{ControlCommand, ControlHandle, ControlResponse};
use super::runtime::{Component, ComponentFuture};
use crate::commands::Dispatcher;
use crate::commands::model::{Namespace, ResponseType};
use crate::config::ConsoleConfig;
use crate::error::AppError;

const HELP: &str = "\
/<trigger> [args]  run a command
:status            host status
:extensions        loaded extensions
:commands          visible commands
:disable <id>      deactivate an extension
:quit              shut down";

pub struct ConsoleChannel {
    dispatcher: Arc<Dispatcher>,
    control: ControlHandle,
    settings: ConsoleConfig,
}

enum Reply {
    Text(String),
    Quit(String),
}

impl ConsoleChannel {
    pub fn new(dispatcher: Arc<Dispatcher>, control: ControlHandle, settings: ConsoleConfig) -> Self {
        Self { dispatcher, control, settings }
    }

    /// Drive the console over an arbitrary reader/writer pair.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        mut writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let namespace = if self.settings.namespace.is_empty() {
            "(global)"
        } else {
            self.settings.namespace.as_str()
        };
        info!(channel_id = %self.settings.channel_id, %namespace, "console channel started");
        write_line(
            &mut writer,
            &format!("command console: team {namespace}, user {} (:help for help)", self.settings.actor),
        )
        .await?;

        let mut lines = reader.lines();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("console channel shutting down");
                    break;
                }

                line = lines.next_line() => {
                    let input = match line {
                        Err(e) => {
                            warn!("console read error: {e}");
                            return Err(AppError::Console(format!("read failed: {e}")));
                        }
                        Ok(None) => {
                            info!("console input closed");
                            break;
                        }
                        Ok(Some(input)) => input.trim().to_string(),
                    };
                    if input.is_empty() {
                        continue;
                    }
                    debug!(%input, "console line");

                    match self.handle_line(&input).await {
                        Reply::Text(text) => write_line(&mut writer, &text).await?,
                        Reply::Quit(text) => {
                            write_line(&mut writer, &text).await?;
                            break;
                        }
                    }
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }

    async fn handle_line(&self, input: &str) -> Reply {
        if input.starts_with('/') {
            let s = &self.settings;
            return Reply::Text(
                match self
                    .dispatcher
                    .execute_line(&s.namespace, &s.actor, &s.channel_id, input)
                    .await
                {
                    Ok(resp) => match resp.response_type {
                        ResponseType::InChannel => resp.text,
                        ResponseType::Ephemeral => format!("(only visible to you) {}", resp.text),
                    },
                    Err(e) => format!("error {} [{}]: {e}", e.status_code(), e.id()),
                },
            );
        }

        let Some(rest) = input.strip_prefix(':') else {
            return Reply::Text("commands start with '/'; :help lists console commands".into());
        };
        let (word, arg) = match rest.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (rest, ""),
        };

        let command = match word {
            "help" => return Reply::Text(HELP.to_string()),
            "status" => ControlCommand::Status,
            "extensions" => ControlCommand::Extensions,
            "commands" => ControlCommand::Commands {
                namespace: Namespace::from_team_id(&self.settings.namespace),
            },
            "disable" if arg.is_empty() => return Reply::Text("usage: :disable <id>".into()),
            "disable" => ControlCommand::Disable { id: arg.to_string() },
            "quit" | "exit" => ControlCommand::Shutdown,
            other => return Reply::Text(format!("unknown console command :{other}")),
        };
        let quitting = command == ControlCommand::Shutdown;

        let text = match self.control.request(command).await {
            Ok(Ok(resp)) => render(resp),
            Ok(Err(e)) => format!("error: {e}"),
            Err(e) => format!("error: {e}"),
        };
        if quitting { Reply::Quit(text) } else { Reply::Text(text) }
    }
}

fn render(resp: ControlResponse) -> String {
    match resp {
        ControlResponse::Health { uptime_ms } => format!("ok, up {uptime_ms} ms"),
        ControlResponse::Status { uptime_ms, extensions, registrations } => {
            format!("up {uptime_ms} ms, {extensions} extension(s), {registrations} command registration(s)")
        }
        ControlResponse::Extensions { extensions } if extensions.is_empty() => "no extensions".into(),
        ControlResponse::Extensions { extensions } => extensions
            .iter()
            .map(|e| {
                format!(
                    "{:<16} {:<8} {:<12} {} command(s)",
                    e.id,
                    e.kind.to_string(),
                    e.state.to_string(),
                    e.registrations
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        ControlResponse::Commands { commands } if commands.is_empty() => "no commands".into(),
        ControlResponse::Commands { commands } => commands
            .iter()
            .map(|c| format!("/{:<14} {:<20} {}", c.trigger, c.source.to_string(), c.description))
            .collect::<Vec<_>>()
            .join("\n"),
        ControlResponse::Ack { message } => message,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<(), AppError> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

impl Component for ConsoleChannel {
    fn id(&self) -> &str {
        &self.settings.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let result = self.serve(stdin, tokio::io::stdout(), shutdown.clone()).await;
            // stdin closing ends the host like Ctrl-C does.
            shutdown.cancel();
            result
        })
    }
}
