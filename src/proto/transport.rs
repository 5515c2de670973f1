// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// First byte of a TLS handshake record (`ContentType::Handshake`). Anything
/// else on a fresh connection is treated as a plaintext HTTP upgrade.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Checks whether the first sniffed byte of a fresh connection looks like the
/// start of a TLS ClientHello.
#[inline]
pub fn is_tls_client_hello(first_byte: u8) -> bool {
    first_byte == TLS_HANDSHAKE_BYTE
}

/// Client-side stream under the WebSocket layer.
#[derive(Debug)]
pub enum ClientTransport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

#[derive(Debug)]
enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// Server-side stream under the WebSocket layer.
///
/// Carries an optional read budget armed for the duration of the upgrade:
/// a client whose handshake exceeds it is cut off with an I/O error before
/// it can balloon the handshake buffer. The budget is cleared once the
/// session is established.
#[derive(Debug)]
pub struct ServerTransport {
    stream: ServerStream,
    handshake_budget: Option<usize>,
}

impl ServerTransport {
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            stream: ServerStream::Plain(stream),
            handshake_budget: None,
        }
    }

    pub fn tls(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Self {
            stream: ServerStream::Tls(Box::new(stream)),
            handshake_budget: None,
        }
    }

    /// Arms the handshake read budget.
    pub fn with_handshake_budget(mut self, max_bytes: usize) -> Self {
        self.handshake_budget = Some(max_bytes);
        self
    }

    /// Disarms the budget once the upgrade completed.
    pub fn clear_handshake_budget(&mut self) {
        self.handshake_budget = None;
    }
}

impl AsyncRead for ClientTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientTransport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientTransport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientTransport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientTransport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientTransport::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientTransport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientTransport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientTransport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for ServerTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = match &mut this.stream {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        };
        if let (Poll::Ready(Ok(())), Some(budget)) = (&polled, &mut this.handshake_budget)
        {
            let received = buf.filled().len() - before;
            if received > *budget {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "handshake exceeds the configured size limit",
                )));
            }
            *budget -= received;
        }
        polled
    }
}

impl AsyncWrite for ServerTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
