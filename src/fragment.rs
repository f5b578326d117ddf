use std::io;
use std::ops::Range;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const TLS_HANDSHAKE_TYPE: u8 = 0x16;
pub const TLS_RECORD_HEADER_LEN: usize = 5;

const CLIENT_HELLO_TYPE: u8 = 0x01;
const HANDSHAKE_HEADER_LEN: usize = 4;
const RANDOM_LEN: usize = 32;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;

/// Where the first ClientHello gets cut before it goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPolicy {
    /// First cut, counted from the start of the record header.
    pub split_offset: usize,
    /// Also cut through the middle of the SNI host name when one is found.
    pub split_sni: bool,
    /// Cut everything after the first cut into pieces of this size. 0 = off.
    pub chunk_size: usize,
    /// Pause between consecutive writes.
    pub delay: Duration,
}

impl Default for FragmentPolicy {
    fn default() -> Self {
        Self {
            split_offset: 1,
            split_sni: true,
            chunk_size: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Splits `hello` into in-order, non-empty pieces covering every byte once.
///
/// Anything of two bytes or more comes back as at least two pieces.
pub fn split<'a>(hello: &'a [u8], policy: &FragmentPolicy) -> Vec<&'a [u8]> {
    let len = hello.len();
    if len < 2 {
        return if len == 0 { Vec::new() } else { vec![hello] };
    }

    let mut cuts = vec![policy.split_offset];

    if policy.split_sni {
        if let Some(sni) = find_sni(hello) {
            cuts.push(sni.start + (sni.len() / 2).max(1));
        }
    }

    if policy.chunk_size > 0 {
        let base = if policy.split_offset < len {
            policy.split_offset
        } else {
            0
        };
        cuts.extend((base.saturating_add(policy.chunk_size)..len).step_by(policy.chunk_size));
    }

    cuts.retain(|&c| c > 0 && c < len);
    cuts.sort_unstable();
    cuts.dedup();

    if cuts.is_empty() {
        cuts.push(len / 2);
    }

    let mut fragments = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        fragments.push(&hello[start..cut]);
        start = cut;
    }
    fragments.push(&hello[start..]);

    fragments
}

/// Writes each fragment with its own write + flush so they leave as
/// separate segments (the socket must have `TCP_NODELAY` set).
pub async fn write_fragments<W>(writer: &mut W, fragments: &[&[u8]], delay: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for (i, fragment) in fragments.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(fragment).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Locates the SNI host name bytes inside a TLS record carrying a
/// ClientHello. Returns `None` for anything that does not parse cleanly.
///
/// Layout walked:
/// record header (5) | handshake header (4) | version (2) | random (32) |
/// session id (1+n) | cipher suites (2+n) | compression (1+n) |
/// extensions (2+n), each type (2) length (2) data.
/// server_name data: list length (2) | name type (1) | name length (2) | name.
pub fn find_sni(record: &[u8]) -> Option<Range<usize>> {
    if *record.first()? != TLS_HANDSHAKE_TYPE
        || *record.get(TLS_RECORD_HEADER_LEN)? != CLIENT_HELLO_TYPE
    {
        return None;
    }

    let mut pos = TLS_RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + 2 + RANDOM_LEN;

    let session_id_len = *record.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = read_u16(record, pos)? as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *record.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(record, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(record.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(record, pos)?;
        let ext_len = read_u16(record, pos + 2)? as usize;
        pos += 4;

        if ext_type == SERVER_NAME_EXTENSION {
            if *record.get(pos + 2)? != HOST_NAME_TYPE {
                return None;
            }
            let name_len = read_u16(record, pos + 3)? as usize;
            let start = pos + 5;
            let end = start + name_len;
            if name_len == 0 || end > record.len() {
                return None;
            }
            return Some(start..end);
        }

        pos += ext_len;
    }

    None
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Minimal but well-formed TLS 1.3 style ClientHello record for `host`.
#[cfg(test)]
pub(crate) fn sample_client_hello(host: &str) -> Vec<u8> {
    let host = host.as_bytes();

    let mut extensions = Vec::new();
    // supported_versions: TLS 1.3
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
    // server_name
    extensions.extend_from_slice(&SERVER_NAME_EXTENSION.to_be_bytes());
    extensions.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
    extensions.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    extensions.push(HOST_NAME_TYPE);
    extensions.extend_from_slice(&(host.len() as u16).to_be_bytes());
    extensions.extend_from_slice(host);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; RANDOM_LEN]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![CLIENT_HELLO_TYPE];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![TLS_HANDSHAKE_TYPE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
