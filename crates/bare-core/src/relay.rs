//! Bidirectional byte relay for the post-handshake WebSocket tunnel
//! (spec.md §4.F "bidirectionally pipe" / §5 "WS relay ... close one
//! side ⇒ close the other"). Adapted from `httproxy::start::tunnel`,
//! which relays two `smol::net::TcpStream` clones with a pair of
//! `smol::io::copy` tasks; generalized here to any
//! `AsyncRead + AsyncWrite` pair (the outbound leg may be a TLS
//! stream) by splitting each side with `futures_lite::io::split`
//! instead of `TcpStream::clone`, and racing the two copy loops plus
//! `cancel` instead of awaiting both, so either side closing, or the
//! cancellation trigger firing (spec.md §5), ends the whole relay
//! within one scheduler turn.

use futures_lite::{AsyncRead, AsyncWrite, io};

use crate::shutdown::CancelToken;

/// Runs until either direction's copy loop finishes (EOF or error) or
/// `cancel` fires, then returns. The caller is expected to drop both
/// streams afterward, which closes the other direction's socket too.
pub async fn tunnel<A, B>(a: A, b: B, cancel: CancelToken) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let a_to_b = smol::spawn(async move { io::copy(&mut a_read, &mut b_write).await });
    let b_to_a = smol::spawn(async move { io::copy(&mut b_read, &mut a_write).await });

    let copies = futures_lite::future::or(async { a_to_b.await.map(|_| ()) }, async { b_to_a.await.map(|_| ()) });

    match cancel.race(copies).await {
        Ok(result) => result,
        Err(_cancelled) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::AsyncWriteExt;

    #[test]
    fn relays_bytes_until_one_side_closes() {
        smol::block_on(async {
            let (client_a, server_a) = async_pipe();
            let (client_b, server_b) = async_pipe();

            let relay = smol::spawn(tunnel(server_a, server_b, CancelToken::new()));

            let mut client_a = client_a;
            let mut client_b = client_b;
            client_a.write_all(b"ping").await.unwrap();
            client_a.close().await.unwrap();

            let mut received = Vec::new();
            futures_lite::AsyncReadExt::read_to_end(&mut client_b, &mut received).await.unwrap();
            assert_eq!(received, b"ping");

            drop(client_b);
            let _ = relay.await;
        });
    }

    /// In-memory duplex pipe for the relay test, grounded on the same
    /// "clone the socket, one reader one writer per direction" shape
    /// as `httproxy::start::tunnel`'s `TcpStream::clone` usage, minus
    /// the real socket.
    fn async_pipe() -> (DuplexEnd, DuplexEnd) {
        let (a_tx, b_rx) = smol::channel::unbounded::<u8>();
        let (b_tx, a_rx) = smol::channel::unbounded::<u8>();
        (
            DuplexEnd { tx: a_tx, rx: Box::pin(a_rx) },
            DuplexEnd { tx: b_tx, rx: Box::pin(b_rx) },
        )
    }

    struct DuplexEnd {
        tx: smol::channel::Sender<u8>,
        rx: std::pin::Pin<Box<smol::channel::Receiver<u8>>>,
    }

    impl AsyncRead for DuplexEnd {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            if buf.is_empty() {
                return std::task::Poll::Ready(Ok(0));
            }
            match futures_lite::Stream::poll_next(self.rx.as_mut(), cx) {
                std::task::Poll::Ready(Some(byte)) => {
                    buf[0] = byte;
                    std::task::Poll::Ready(Ok(1))
                }
                std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(0)),
                std::task::Poll::Pending => std::task::Poll::Pending,
            }
        }
    }

    impl AsyncWrite for DuplexEnd {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            for &byte in buf {
                if self.tx.try_send(byte).is_err() {
                    return std::task::Poll::Ready(Ok(0));
                }
            }
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            self.tx.close();
            std::task::Poll::Ready(Ok(()))
        }
    }
}
