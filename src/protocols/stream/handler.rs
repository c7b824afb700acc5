//! Line echo session loop.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::parser::{self, ParseResult};
use crate::error::SessionError;
use crate::protocols::SessionEnd;

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Handle one stream connection until the peer closes, an error occurs, or
/// `token` is cancelled.
///
/// Responses are written before the next read, so a slow reader only ever
/// holds back its own session.
pub async fn handle_connection<S>(
    mut stream: S,
    max_line_length: usize,
    token: CancellationToken,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut response = BytesMut::with_capacity(BUFFER_SIZE);
    // Leading bytes of `buffer` already searched for a terminator
    let mut scanned = 0;

    loop {
        // Answer every complete line already buffered
        loop {
            match parser::parse(&buffer, scanned, max_line_length) {
                ParseResult::Complete(len) => {
                    let line = buffer.split_to(len);
                    scanned = 0;
                    trace!(bytes = line.len(), "Echoing line");

                    response.clear();
                    parser::response(&line, &mut response);

                    // A peer that never reads must not hold up shutdown
                    tokio::select! {
                        _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
                        written = stream.write_all(&response) => written?,
                    }
                }
                ParseResult::Incomplete => {
                    scanned = buffer.len();
                    break;
                }
                ParseResult::TooLong => {
                    return Err(SessionError::LineTooLong {
                        limit: max_line_length,
                    });
                }
            }
        }

        let n = tokio::select! {
            _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
            read = stream.read_buf(&mut buffer) => read?,
        };

        if n == 0 {
            if !buffer.is_empty() {
                debug!(bytes = buffer.len(), "Discarding unterminated line");
            }
            return Ok(SessionEnd::PeerClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_echo_single_line() {
        let mock = Builder::new()
            .read(b"ping\n")
            .write(b"Message received: ping\n")
            .build();

        let end = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let mock = Builder::new()
            .read(b"hel")
            .read(b"lo\nwor")
            .write(b"Message received: hello\n")
            .read(b"ld\r\n")
            .write(b"Message received: world\r\n")
            .build();

        let end = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_several_lines_in_one_read() {
        let mock = Builder::new()
            .read(b"a\nb\n")
            .write(b"Message received: a\n")
            .write(b"Message received: b\n")
            .build();

        handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_not_echoed() {
        let mock = Builder::new()
            .read(b"done\nleftover")
            .write(b"Message received: done\n")
            .build();

        let end = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_read_error_ends_session() {
        let mock = Builder::new()
            .read(b"one\n")
            .write(b"Message received: one\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SessionError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_error_is_terminal() {
        let mock = Builder::new()
            .read(b"one\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let err = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mock = Builder::new().read(b"0123456789").build();

        let err = handle_connection(mock, 8, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong { limit: 8 }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_session() {
        let (client, server) = duplex(64);
        let token = CancellationToken::new();

        let session = tokio::spawn(handle_connection(server, 0, token.clone()));
        token.cancel();

        let end = session.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        drop(client);
    }

    #[tokio::test]
    async fn test_cancellation_stops_session_blocked_on_write() {
        // Replies overflow the 64 byte pipe because the client never reads
        let (mut client, server) = duplex(64);
        let token = CancellationToken::new();

        let session = tokio::spawn(handle_connection(server, 0, token.clone()));
        client.write_all(&b"ping\n".repeat(10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!session.is_finished());

        token.cancel();
        let end = tokio::time::timeout(std::time::Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_long_line_across_many_reads() {
        let chunk = b"0123456789abcdef";
        let mut expected = b"Message received: ".to_vec();
        let mut builder = Builder::new();
        for _ in 0..64 {
            builder.read(chunk);
            expected.extend_from_slice(chunk);
        }
        expected.push(b'\n');
        let mock = builder.read(b"\n").write(&expected).build();

        let end = handle_connection(mock, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (mut client, server) = duplex(1024);
        let session = tokio::spawn(handle_connection(server, 0, CancellationToken::new()));

        client.write_all(b"ping\n").await.unwrap();
        let expected = b"Message received: ping\n";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], expected);

        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::PeerClosed);
    }
}
