//! Client-side vendor protocol (§6): a small set of ASCII commands, each
//! session-framed exactly like the mirror protocol in `protocol.rs`.
//!
//! The vendor's own bookkeeping - the TTL map of advertised mirrors behind
//! `GET MIRRORLIST`, and pushing `MANIFEST UPDATE` out to mirrors - is a
//! vendor-internal concern and out of scope; this module only speaks the
//! client (and mirror-advertisement) side of the wire.

use crate::error::RaidPirError;
use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::protocol::{read_frame, write_frame};

const HELLO_REPLY: &[u8] = b"VENDORHI!";
const ADVERTISE_OK: &[u8] = b"OK";

/// One entry of `GET MIRRORLIST`'s reply, and the payload of
/// `MIRRORADVERTISE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub ip: String,
    pub port: u16,
}

/// Opens a connection to the vendor and fetches the manifest.
pub async fn fetch_manifest(host: &str, port: u16) -> Result<Manifest, RaidPirError> {
    let mut stream = connect(host, port).await?;
    let bytes = get_manifest(&mut stream).await?;
    Manifest::parse(&bytes)
}

/// Opens a connection to the vendor (or mirror-list endpoint, which per
/// §6 may be the same address) and fetches the current mirror list.
pub async fn fetch_mirror_list(host: &str, port: u16) -> Result<Vec<MirrorRecord>, RaidPirError> {
    let mut stream = connect(host, port).await?;
    get_mirror_list(&mut stream).await
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, RaidPirError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| RaidPirError::Network(e.into()))
}

/// `GET MANIFEST` → raw manifest bytes.
pub async fn get_manifest<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<Vec<u8>, RaidPirError> {
    write_frame(stream, b"GET MANIFEST").await?;
    read_frame(stream).await
}

/// `GET MIRRORLIST` → the vendor's current list of advertised mirrors.
pub async fn get_mirror_list<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<Vec<MirrorRecord>, RaidPirError> {
    write_frame(stream, b"GET MIRRORLIST").await?;
    let bytes = read_frame(stream).await?;
    rmp_serde::from_slice(&bytes).map_err(|e| {
        RaidPirError::ProtocolError(format!("malformed mirror list from vendor: {}", e))
    })
}

/// `HELLO` → `VENDORHI!`. A bare connectivity check; returns `Ok(())` only
/// if the vendor answered with exactly the expected greeting.
pub async fn hello<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), RaidPirError> {
    write_frame(stream, b"HELLO").await?;
    let reply = read_frame(stream).await?;
    if reply == HELLO_REPLY {
        Ok(())
    } else {
        Err(RaidPirError::ProtocolError(
            "vendor did not answer HELLO with VENDORHI!".into(),
        ))
    }
}

/// `MIRRORADVERTISE` + serialized mirror info, sent by a mirror announcing
/// itself to the vendor. Returns `Ok(())` on `OK`, or the vendor's error
/// string as a `ProtocolError` otherwise.
pub async fn advertise<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    record: &MirrorRecord,
) -> Result<(), RaidPirError> {
    let mut payload = b"MIRRORADVERTISE".to_vec();
    let body = rmp_serde::to_vec(record)
        .map_err(|e| RaidPirError::ProtocolError(format!("cannot serialize mirror info: {}", e)))?;
    payload.extend_from_slice(&body);
    write_frame(stream, &payload).await?;
    let reply = read_frame(stream).await?;
    if reply == ADVERTISE_OK {
        Ok(())
    } else {
        Err(RaidPirError::ProtocolError(format!(
            "vendor rejected advertisement: {}",
            String::from_utf8_lossy(&reply)
        )))
    }
}
