use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{FrameError, Message, MessageKind, read_frame, write_message},
};

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Upload(PathBuf),
    Exit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let text = line.trim_end_matches(['\n', '\r']);
        if text.trim().is_empty() {
            return Self::Empty;
        }
        if text == ":e" || text == ":exit" {
            return Self::Exit;
        }
        if let Some(path) = text.strip_prefix(":file ") {
            let path = path.trim();
            if !path.is_empty() {
                return Self::Upload(PathBuf::from(path));
            }
        }
        Self::Chat(text.to_string())
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let username = args.username.trim().to_string();
    if username.is_empty() {
        bail!("username must not be empty");
    }

    let (reader, mut writer) = establish_connection(&args).await?;
    write_message(&mut writer, &Message::hello(&username).stamped()).await?;

    // Frames arrive through a channel so the select loop below only awaits
    // cancel-safe futures.
    let (frames_tx, mut frames) = mpsc::channel(64);
    let forwarder = tokio::spawn(forward_frames(reader, frames_tx));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = Vec::new();

    let result = run_client_loop(
        &args,
        &username,
        &mut frames,
        &mut writer,
        &mut stdin,
        &mut input,
    )
    .await;
    forwarder.abort();
    shutdown_connection(&mut writer).await;

    result
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    info!("connected to {}:{}", args.host, args.port);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn forward_frames(
    mut reader: BufReader<OwnedReadHalf>,
    frames: mpsc::Sender<Result<Option<Message>, FrameError>>,
) {
    loop {
        let frame = read_frame(&mut reader).await;
        let last = matches!(frame, Ok(None))
            || frame.as_ref().is_err_and(|err| !err.is_recoverable());
        if frames.send(frame).await.is_err() || last {
            return;
        }
    }
}

async fn run_client_loop(
    args: &ClientArgs,
    username: &str,
    frames: &mut mpsc::Receiver<Result<Option<Message>, FrameError>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut Vec<u8>,
) -> Result<()> {
    loop {
        select! {
            server_message = frames.recv() => {
                let server_message = server_message.unwrap_or(Ok(None));
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_until(b'\n', input) => {
                let line = String::from_utf8_lossy(input).into_owned();
                input.clear();
                if !handle_stdin_input(bytes_read, &line, args, username, writer).await? {
                    break;
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
    Ok(())
}

async fn handle_server_message(message: Result<Option<Message>, FrameError>) -> Result<bool> {
    match message {
        Ok(Some(message)) => {
            render_server_message(message).await?;
            Ok(true)
        }
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(err) if err.is_recoverable() => {
            warn!(error = %err, "ignoring undecodable frame from server");
            Ok(true)
        }
        Err(err) => Err(err).context("lost connection to server"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    args: &ClientArgs,
    username: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match Input::parse(input) {
        Input::Empty => Ok(true),
        Input::Exit => {
            write_message(writer, &Message::leave(username).stamped()).await?;
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        Input::Upload(path) => {
            spawn_upload(args.host.clone(), args.file_port, path);
            Ok(true)
        }
        Input::Chat(text) => {
            write_message(writer, &Message::chat(username, text).stamped()).await?;
            Ok(true)
        }
    }
}

fn spawn_upload(host: String, port: u16, path: PathBuf) {
    tokio::spawn(async move {
        let outcome = match upload_file((host.as_str(), port), &path).await {
            Ok(sent) => {
                write_stdout(&format!("*** sent {sent} bytes of {}", path.display())).await
            }
            Err(err) => {
                write_stderr(&format!("!!! upload of {} failed: {err:#}", path.display())).await
            }
        };
        if let Err(error) = outcome {
            warn!(?error, "failed to report upload result");
        }
    });
}

/// Sends `path` over the file channel: header line, raw bytes, then close.
pub async fn upload_file<A>(addr: A, path: &Path) -> Result<u64>
where
    A: tokio::net::ToSocketAddrs,
{
    let mut file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata().await?.len();
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;

    let mut stream = TcpStream::connect(addr)
        .await
        .context("failed to connect to file channel")?;
    stream.write_all(format!("{name} {len}\n").as_bytes()).await?;
    let sent = tokio::io::copy(&mut file, &mut stream).await?;
    stream.shutdown().await?;

    if sent != len {
        bail!("{} changed while sending: expected {len} bytes, sent {sent}", path.display());
    }
    Ok(sent)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_server_message(message: Message) -> io::Result<()> {
    match message.kind {
        MessageKind::Hello => write_stdout("*** connected").await,
        MessageKind::Leave => {
            write_stdout(&format!("*** {} left the chat", message.sender)).await
        }
        MessageKind::Chat => {
            write_stdout(&format!("<{}> {}", message.sender, message.content)).await
        }
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

    #[test]
    fn parses_commands_and_chat() {
        assert_eq!(Input::parse(":e\n"), Input::Exit);
        assert_eq!(Input::parse(":exit"), Input::Exit);
        assert_eq!(
            Input::parse(":file /tmp/notes.txt\n"),
            Input::Upload(PathBuf::from("/tmp/notes.txt"))
        );
        assert_eq!(Input::parse("   \n"), Input::Empty);
        assert_eq!(Input::parse("hello there\n"), Input::Chat("hello there".into()));
        assert_eq!(Input::parse(":file"), Input::Chat(":file".into()));
    }
}
