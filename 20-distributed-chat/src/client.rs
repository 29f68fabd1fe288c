use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{self, ChatMessage, ClientRequest, MessageDraft, ServerEvent},
    room,
};

/// What a line typed by the user turns into.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Send(ClientRequest),
    Quit,
    Nothing,
    Usage(&'static str),
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut writer, mut reader) = socket.split();
    send(&mut writer, &ClientRequest::Login(args.name.clone())).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            frame = reader.next() => {
                if !handle_frame(frame, &args.name).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                match parse_input(&input) {
                    Input::Send(request) => send(&mut writer, &request).await?,
                    Input::Usage(usage) => write_stderr(&format!("!!! {usage}")).await?,
                    Input::Nothing => {}
                    Input::Quit => {
                        send(&mut writer, &ClientRequest::Logout).await?;
                        write_stdout("*** leaving chat").await?;
                        break;
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
    Ok(())
}

async fn send<S>(writer: &mut S, request: &ClientRequest) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = message::encode(request)?;
    writer.send(Message::Text(text)).await?;
    Ok(())
}

async fn handle_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    me: &str,
) -> Result<bool> {
    let text = match frame {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Some(Ok(_)) => return Ok(true),
        Some(Err(err)) => return Err(err).context("connection failed"),
    };

    match message::decode::<ServerEvent>(text.as_bytes()) {
        Ok(event) => {
            for line in render(&event, me) {
                write_stdout(&line).await?;
            }
        }
        Err(error) => warn!(?error, "ignoring undecodable server event"),
    }
    Ok(true)
}

/// Parses one line of user input.
pub fn parse_input(line: &str) -> Input {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return Input::Nothing;
    }
    if !text.starts_with('/') {
        return Input::Send(ClientRequest::Message(MessageDraft {
            recipient: String::new(),
            body: text.to_string(),
        }));
    }

    let mut parts = text.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    match command.to_ascii_lowercase().as_str() {
        "/quit" => Input::Quit,
        "/history" => {
            let peer = parts.next().map(str::trim).filter(|peer| !peer.is_empty());
            Input::Send(ClientRequest::History(peer.map(str::to_string)))
        }
        "/msg" => match (parts.next(), parts.next()) {
            (Some(recipient), Some(body)) if !body.trim().is_empty() => {
                Input::Send(ClientRequest::Message(MessageDraft {
                    recipient: recipient.to_string(),
                    body: body.to_string(),
                }))
            }
            _ => Input::Usage("usage: /msg <user> <text>"),
        },
        _ => Input::Usage("commands: /msg <user> <text>, /history [user], /quit"),
    }
}

/// Turns a server event into the lines shown to `me`.
pub fn render(event: &ServerEvent, me: &str) -> Vec<String> {
    match event {
        ServerEvent::Login(login) => {
            let mut lines = vec![format!("*** connected as {}", login.username)];
            lines.push(format!("*** currently online: {}", login.users.join(", ")));
            let peers: Vec<_> = login
                .rooms
                .iter()
                .filter_map(|key| room::peer_in(key, me))
                .collect();
            if !peers.is_empty() {
                lines.push(format!("*** conversations with: {}", peers.join(", ")));
            }
            lines.extend(login.messages.iter().rev().map(render_message));
            lines
        }
        ServerEvent::History(history) => {
            let title = match &history.peer {
                Some(peer) => format!("*** history with {peer}"),
                None => "*** public history".to_string(),
            };
            std::iter::once(title)
                .chain(history.messages.iter().rev().map(render_message))
                .collect()
        }
        ServerEvent::Message(chat) => vec![render_message(chat)],
        ServerEvent::Join(presence) if presence.name != me => {
            vec![format!("*** {} joined the chat", presence.name)]
        }
        ServerEvent::Join(_) => Vec::new(),
        ServerEvent::Leave(presence) => vec![format!("*** {} left the chat", presence.name)],
        ServerEvent::Error(error) => vec![format!("!!! {}", error.message)],
    }
}

fn render_message(chat: &ChatMessage) -> String {
    if chat.is_public() {
        format!("<{}> {}", chat.author, chat.body)
    } else {
        format!("<{} -> {}> {}", chat.author, chat.recipient, chat.body)
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorResponse, LoginResponse, Presence};

    fn chat(author: &str, recipient: &str, body: &str) -> ChatMessage {
        ChatMessage {
            author: author.into(),
            recipient: recipient.into(),
            body: body.into(),
            sent_at: 0,
        }
    }

    #[test]
    fn plain_text_is_a_public_message() {
        assert_eq!(
            parse_input("hello there\n"),
            Input::Send(ClientRequest::Message(MessageDraft {
                recipient: String::new(),
                body: "hello there".into(),
            }))
        );
        assert_eq!(parse_input("   \n"), Input::Nothing);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(
            parse_input("/msg bob see you at 5"),
            Input::Send(ClientRequest::Message(MessageDraft {
                recipient: "bob".into(),
                body: "see you at 5".into(),
            }))
        );
        assert!(matches!(parse_input("/msg bob"), Input::Usage(_)));
        assert_eq!(
            parse_input("/history"),
            Input::Send(ClientRequest::History(None))
        );
        assert_eq!(
            parse_input("/history alice"),
            Input::Send(ClientRequest::History(Some("alice".into())))
        );
        assert_eq!(parse_input("/QUIT"), Input::Quit);
        assert!(matches!(parse_input("/dance"), Input::Usage(_)));
    }

    #[test]
    fn login_lists_users_conversations_and_history_oldest_first() {
        let event = ServerEvent::Login(LoginResponse {
            username: "alice".into(),
            users: vec!["alice".into(), "bob".into()],
            rooms: vec!["".into(), "alice:bob".into()],
            messages: vec![chat("bob", "", "second"), chat("carol", "", "first")],
        });

        assert_eq!(
            render(&event, "alice"),
            vec![
                "*** connected as alice",
                "*** currently online: alice, bob",
                "*** conversations with: bob",
                "<carol> first",
                "<bob> second",
            ]
        );
    }

    #[test]
    fn events_render_as_single_lines() {
        assert_eq!(
            render(&ServerEvent::Message(chat("alice", "bob", "psst")), "bob"),
            vec!["<alice -> bob> psst"]
        );
        assert_eq!(
            render(&ServerEvent::Join(Presence { name: "bob".into() }), "alice"),
            vec!["*** bob joined the chat"]
        );
        assert!(render(&ServerEvent::Join(Presence { name: "alice".into() }), "alice").is_empty());
        assert_eq!(
            render(
                &ServerEvent::Error(ErrorResponse {
                    message: "user with this name already logged in".into()
                }),
                "alice"
            ),
            vec!["!!! user with this name already logged in"]
        );
    }
}
