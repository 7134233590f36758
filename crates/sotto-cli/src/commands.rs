//! Client session flow: connect, admit, chat.

use crate::Args;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use sotto_core::crypto::fingerprint;
use sotto_core::messaging::channel::Transport;
use sotto_core::messaging::{Channel, ChannelConfig, ChannelSink, ChatEvent, Role};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;

/// Connect to the relay, wrapping the stream in TLS with system trust
/// roots unless the address targets localhost.
async fn connect(addr: &str) -> Result<Box<dyn Transport>> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to relay at {addr}"))?;

    if addr.starts_with("localhost:") {
        return Ok(Box::new(tcp));
    }

    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let connector = tokio_native_tls::TlsConnector::from(
        native_tls::TlsConnector::new().context("building TLS connector")?,
    );
    let tls = connector
        .connect(host, tcp)
        .await
        .with_context(|| format!("TLS handshake with {host}"))?;
    Ok(Box::new(tls))
}

/// Send the opening command and parse the relay's reply line.
///
/// Returns the session id and the handshake role this side plays: the
/// creator initiates, the joiner responds.
async fn admit(
    stream: &mut Box<dyn Transport>,
    session_id: Option<&str>,
) -> Result<(String, Role)> {
    let hello = match session_id {
        Some(id) => json!({"command": "JOIN", "sessionID": id}),
        None => json!({"command": "CREATE"}),
    };
    let mut line = serde_json::to_vec(&hello)?;
    line.push(b'\n');
    stream.write_all(&line).await.context("sending command")?;

    let reply = read_reply_line(stream).await?;

    if let Some(id) = reply.strip_prefix("Session created: ") {
        Ok((id.to_string(), Role::Initiator))
    } else if let Some(id) = reply.strip_prefix("Joined session: ") {
        Ok((id.to_string(), Role::Responder))
    } else if let Some(message) = reply.strip_prefix("Error: ") {
        bail!("relay refused: {message}")
    } else {
        bail!("unexpected relay reply: {reply}")
    }
}

/// Read the one-line admission reply byte by byte.
///
/// Anything past the newline already belongs to the framed protocol, so
/// no read-ahead is allowed here.
async fn read_reply_line(stream: &mut Box<dyn Transport>) -> Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.context("reading relay reply")?;
        if n == 0 {
            bail!("relay closed the connection during admission");
        }
        if byte[0] == b'\n' {
            return String::from_utf8(line).map_err(|_| anyhow!("relay reply was not UTF-8"));
        }
        line.push(byte[0]);
        if line.len() > 1024 {
            bail!("relay reply too long");
        }
    }
}

/// Run the whole client session to completion.
pub async fn run(args: Args) -> Result<()> {
    let mut stream = connect(&args.relay_server_addr).await?;
    let (session_id, role) = admit(&mut stream, args.session_id.as_deref()).await?;

    match role {
        Role::Initiator => {
            println!("System: session created, share this id: {session_id}");
            println!("System: waiting for a peer to join...");
        }
        Role::Responder => println!("System: joined session {session_id}"),
    }

    let (sink, mut events) = ChannelSink::new();
    let config = ChannelConfig {
        role,
        nickname: args.nickname.clone(),
        max_file_bytes: args.max_file_size * 1024 * 1024,
        download_dir: PathBuf::from(&args.download_dir),
    };
    let channel = Channel::establish(stream, config, Arc::new(sink))
        .await
        .context("establishing encrypted channel")?;

    let mut printer = tokio::spawn(async move {
        let mut last_quarter = 0u8;
        while let Some(event) = events.recv().await {
            if print_event(event, &mut last_quarter) {
                return;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("System: type a message, or /send <path>, /accept, /reject, /quit");

    loop {
        tokio::select! {
            _ = &mut printer => {
                // Connection closed (or UI gone); we are done.
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    let _ = channel.close().await;
                    break;
                };
                if handle_input(&channel, line.trim()).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Dispatch one line of user input. Returns `true` to quit.
async fn handle_input(channel: &Channel, line: &str) -> bool {
    if line.is_empty() {
        return false;
    }

    if let Some(path) = line.strip_prefix("/send ") {
        // Failures surface through the sink as OfferFailed events.
        let _ = channel.offer_file(std::path::Path::new(path.trim())).await;
    } else if line == "/accept" {
        let _ = channel.accept_offer().await;
    } else if line == "/reject" {
        let _ = channel.reject_offer().await;
    } else if line == "/quit" {
        let _ = channel.close().await;
        return true;
    } else if line.starts_with('/') {
        println!("System: unknown command {line}");
    } else if channel.send_text(line).await.is_ok() {
        println!("me: {line}");
    } else {
        println!("Error: could not send message");
    }
    false
}

/// Print one sink event. Returns `true` once the connection is closed.
fn print_event(event: ChatEvent, last_quarter: &mut u8) -> bool {
    match event {
        ChatEvent::Error(message) => println!("Error: {message}"),
        ChatEvent::Info(message) => println!("System: {message}"),
        ChatEvent::Connected => println!("System: connected to relay"),
        ChatEvent::SharedKeyEstablished => {
            println!("System: encrypted channel established")
        }
        ChatEvent::MyPublicKey(key) => {
            println!("System: your fingerprint: {}", fingerprint(&key))
        }
        ChatEvent::PeerPublicKey(key) => {
            println!(
                "System: peer fingerprint: {} (compare out-of-band)",
                fingerprint(&key)
            )
        }
        ChatEvent::ReceivedText { sender, text } => println!("{sender}: {text}"),
        ChatEvent::FileOffer { metadata, sender } => {
            *last_quarter = 0;
            println!(
                "System: {sender} offers '{}' ({} bytes). /accept or /reject",
                metadata.file_name, metadata.file_size
            )
        }
        ChatEvent::FileOfferAccepted(metadata) => {
            *last_quarter = 0;
            println!("System: offer accepted, sending '{}'", metadata.file_name)
        }
        ChatEvent::FileOfferRejected(sender) => {
            println!("System: {sender} rejected the file offer")
        }
        ChatEvent::FileOfferFailed(reason) => println!("Error: {reason}"),
        ChatEvent::FileChunk(_) => {}
        ChatEvent::FileDone => println!("System: file received"),
        ChatEvent::Progress(fraction) => {
            let quarter = (fraction * 4.0) as u8;
            if quarter > *last_quarter {
                *last_quarter = quarter;
                println!("System: transfer {:.0}% complete", fraction * 100.0);
            }
        }
        ChatEvent::ConnectionClosed => {
            println!("System: connection closed");
            return true;
        }
        ChatEvent::UserJoined { nickname, public_key, .. } => {
            println!(
                "System: {nickname} joined (fingerprint {})",
                fingerprint(&public_key)
            )
        }
        ChatEvent::UserLeft(user_id) => println!("System: {user_id} left"),
        ChatEvent::PeerIntroduced { nickname, public_key, .. } => {
            println!(
                "System: {nickname} is here (fingerprint {})",
                fingerprint(&public_key)
            )
        }
    }
    false
}
