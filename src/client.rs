//! Clients for the stream and datagram services.

use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Largest reply accepted by the datagram client
const MAX_REPLY_SIZE: usize = 65_535;

/// How long the datagram client waits for an acknowledgment
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented client for the stream listener.
pub struct StreamClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl StreamClient {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(peer = %stream.peer_addr()?, "Connected");
        let (reader, writer) = stream.into_split();
        Ok(StreamClient {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send one line (a `\n` is appended if missing) and wait for the reply
    /// line, terminator included.
    pub async fn exchange(&mut self, line: &str) -> io::Result<String> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        Ok(reply)
    }

    /// Close the write side so the server sees an orderly disconnect.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Connect, exchange a single line, and disconnect.
pub async fn stream_exchange(addr: &str, line: &str) -> io::Result<String> {
    let mut client = StreamClient::connect(addr).await?;
    let reply = client.exchange(line).await?;
    client.close().await?;
    Ok(reply)
}

/// Forward stdin lines to the listener at `addr` and print each reply until
/// stdin closes.
pub async fn run_interactive(addr: &str) -> io::Result<()> {
    let mut client = StreamClient::connect(addr).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = client.exchange(&line).await?;
        print!("{reply}");
    }

    client.close().await
}

/// Send one datagram to `addr` and wait up to `timeout` for the reply.
pub async fn datagram_exchange(addr: &str, payload: &[u8], timeout: Duration) -> io::Result<Bytes> {
    let target = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;

    let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    socket.send(payload).await?;

    let mut buffer = vec![0u8; MAX_REPLY_SIZE];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buffer))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply before timeout"))??;
    buffer.truncate(n);
    Ok(Bytes::from(buffer))
}
