//! Bidirectional byte relay for one tunnel pair.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Instrument;

const RELAY_BUFFER_SIZE: usize = 8192;

/// Which end of a tunnel pair ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The inbound (supervisor-side) connection.
    Client,
    /// The local destination port.
    Destination,
}

/// Summary of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes_to_destination: u64,
    pub bytes_from_destination: u64,
    /// Side whose read half finished first.
    pub closed_by: Side,
    /// Error that ended the relay, if it did not end on a clean EOF.
    pub error: Option<io::Error>,
}

/// Relay bytes between `client` and `destination`.
///
/// The client-to-destination direction runs on its own task so neither
/// direction can stall the other. A clean EOF from the client is passed on
/// as a write shutdown and the destination keeps answering until it closes
/// its side. The pair is torn down when the destination side finishes or
/// when the client side fails.
pub async fn relay(client: TcpStream, destination: TcpStream) -> RelayOutcome {
    let (client_read, client_write) = client.into_split();
    let (destination_read, destination_write) = destination.into_split();

    let to_destination = Arc::new(AtomicU64::new(0));
    let from_destination = Arc::new(AtomicU64::new(0));

    let mut forward = tokio::spawn(
        copy_stream(client_read, destination_write, Arc::clone(&to_destination))
            .in_current_span(),
    );
    let backward = copy_stream(
        destination_read,
        client_write,
        Arc::clone(&from_destination),
    );
    tokio::pin!(backward);

    let (closed_by, result) = tokio::select! {
        biased;
        joined = &mut forward => {
            match joined.unwrap_or_else(|e| Err(io::Error::other(e))) {
                // Half-close: drain the destination's answer.
                Ok(()) => (Side::Client, backward.await),
                Err(e) => (Side::Client, Err(e)),
            }
        }
        result = &mut backward => {
            forward.abort();
            (Side::Destination, result)
        }
    };

    RelayOutcome {
        bytes_to_destination: to_destination.load(Ordering::Relaxed),
        bytes_from_destination: from_destination.load(Ordering::Relaxed),
        closed_by,
        error: result.err(),
    }
}

/// Copy one direction in order until EOF, then shut the writer down.
async fn copy_stream<R, W>(mut reader: R, mut writer: W, total: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_preserves_order_both_ways() {
        // client_outer <-> client_inner ==relay== destination_inner <-> destination_outer
        let (mut client_outer, client_inner) = connected_pair().await;
        let (destination_inner, mut destination_outer) = connected_pair().await;

        let relay_task = tokio::spawn(relay(client_inner, destination_inner));

        let upstream: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let downstream: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();

        let writer = {
            let upstream = upstream.clone();
            async move {
                client_outer.write_all(&upstream).await.unwrap();
                let mut received = vec![0u8; 50_000];
                client_outer.read_exact(&mut received).await.unwrap();
                client_outer
            }
        };
        let echo = async {
            let mut received = vec![0u8; upstream.len()];
            destination_outer.read_exact(&mut received).await.unwrap();
            destination_outer.write_all(&downstream).await.unwrap();
            received
        };

        let (client_outer, received_upstream) = tokio::join!(writer, echo);
        assert_eq!(received_upstream, upstream);

        drop(client_outer);
        let mut rest = Vec::new();
        destination_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(destination_outer);

        let outcome = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay should finish once both sides close")
            .unwrap();

        assert_eq!(outcome.closed_by, Side::Client);
        assert_eq!(outcome.bytes_to_destination, upstream.len() as u64);
        assert_eq!(outcome.bytes_from_destination, downstream.len() as u64);
    }

    #[tokio::test]
    async fn test_client_half_close_still_receives_answer() {
        let (mut client_outer, client_inner) = connected_pair().await;
        let (destination_inner, mut destination_outer) = connected_pair().await;

        let relay_task = tokio::spawn(relay(client_inner, destination_inner));

        client_outer.write_all(b"hello").await.unwrap();
        client_outer.shutdown().await.unwrap();

        // The destination only answers once it has seen the whole request.
        let mut request = Vec::new();
        destination_outer.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"hello");
        destination_outer.write_all(b"response:hello").await.unwrap();
        drop(destination_outer);

        let mut answer = Vec::new();
        timeout(Duration::from_secs(5), client_outer.read_to_end(&mut answer))
            .await
            .expect("client should receive the answer and then EOF")
            .unwrap();
        assert_eq!(answer, b"response:hello");

        let outcome = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay should finish once the destination closes")
            .unwrap();
        assert_eq!(outcome.closed_by, Side::Client);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.bytes_to_destination, 5);
        assert_eq!(outcome.bytes_from_destination, 14);
    }

    #[tokio::test]
    async fn test_destination_close_closes_client() {
        let (mut client_outer, client_inner) = connected_pair().await;
        let (destination_inner, destination_outer) = connected_pair().await;

        let relay_task = tokio::spawn(relay(client_inner, destination_inner));
        drop(destination_outer);

        let outcome = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay should finish once the destination closes")
            .unwrap();
        assert_eq!(outcome.closed_by, Side::Destination);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), client_outer.read(&mut buf))
            .await
            .expect("client should observe the close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
