//! The cleartext HTTP/2 upgrade handshake.
//!
//! An `OPTIONS *` request carries `Upgrade: h2c` and the client SETTINGS in
//! `HTTP2-Settings`. A `101 Switching Protocols` answer switches the transport
//! to HTTP/2; any final status leaves it on HTTP/1.1.

use crate::ClientError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::StreamExt;
use http::{StatusCode, header};
use micro_client_proto::codec::ResponseDecoder;
use micro_client_proto::codec::h2::Settings;
use micro_client_proto::protocol::{Message, PayloadItem, PayloadSize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tracing::debug;

#[derive(Debug)]
pub(super) enum Upgrade {
    /// The peer switched; the bytes already read belong to the HTTP/2 stream.
    Switched(Bytes),
    /// The peer answered over HTTP/1.1. `reusable` is false when the answer closed the connection.
    Refused { leftover: Bytes, reusable: bool },
}

pub(super) async fn h2c<T>(io: &mut T, authority: &str, settings: &Settings) -> Result<Upgrade, ClientError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "OPTIONS * HTTP/1.1\r\nhost: {authority}\r\nconnection: Upgrade, HTTP2-Settings\r\nupgrade: h2c\r\nhttp2-settings: {}\r\n\r\n",
        URL_SAFE_NO_PAD.encode(settings.payload())
    );
    io.write_all(request.as_bytes()).await.map_err(ClientError::connect)?;
    io.flush().await.map_err(ClientError::connect)?;

    let mut framed = FramedRead::new(io, ResponseDecoder::new());
    let mut reusable = true;
    loop {
        let Some(message) = framed.next().await else {
            return Err(ClientError::ClosedConnection);
        };
        match message? {
            Message::Header((head, _)) if head.status() == StatusCode::SWITCHING_PROTOCOLS => {
                debug!(authority, "h2c upgrade accepted");
                return Ok(Upgrade::Switched(framed.read_buffer_mut().split().freeze()));
            }
            Message::Header((head, _)) if head.status().is_informational() => {}
            Message::Header((head, size)) => {
                debug!(authority, status = %head.status(), "h2c upgrade refused");
                let close = head.headers().get(header::CONNECTION).and_then(|v| v.to_str().ok()).is_some_and(|v| v.eq_ignore_ascii_case("close"));
                reusable = !close && !matches!(size, PayloadSize::UntilClose);
            }
            Message::Payload(PayloadItem::Eof) => {
                return Ok(Upgrade::Refused { leftover: framed.read_buffer_mut().split().freeze(), reusable });
            }
            Message::Payload(_) => {}
        }
    }
}
