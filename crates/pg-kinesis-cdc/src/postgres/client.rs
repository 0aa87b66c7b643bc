//! PostgreSQL replication client
//!
//! Low-level TCP client for the streaming replication protocol: startup
//! in `replication=database` mode, cleartext/MD5 authentication, slot
//! administration, and the CopyBoth stream carrying `test_decoding`
//! output.

use crate::common::Lsn;
use crate::postgres::params::ConnectParams;
use anyhow::{anyhow, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info};

/// The logical decoding plugin this bridge consumes.
pub const OUTPUT_PLUGIN: &str = "test_decoding";

/// PostgreSQL replication client
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect to PostgreSQL in replication mode.
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        info!(
            "connecting to {}:{} as {} (database {})",
            params.host, params.port, params.user, params.database
        );
        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .with_context(|| format!("unable to reach {}:{}", params.host, params.port))?;
        let mut stream = BufReader::new(stream);

        // 1. Startup message
        let startup = vec![
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup.into_iter(), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // 2. Authentication
        loop {
            let (type_code, body) = read_message(&mut stream).await?;

            let mut raw_msg = BytesMut::with_capacity(1 + 4 + body.len());
            raw_msg.put_u8(type_code);
            raw_msg.put_i32((body.len() + 4) as i32);
            raw_msg.put_slice(&body);

            let msg = backend::Message::parse(&mut raw_msg)?
                .ok_or_else(|| anyhow!("failed to parse auth message"))?;

            match msg {
                backend::Message::AuthenticationOk => {
                    debug!("authentication successful");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let pass = params
                        .password
                        .as_deref()
                        .ok_or_else(|| anyhow!("password required but not provided"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let pass = params
                        .password
                        .as_deref()
                        .ok_or_else(|| anyhow!("password required but not provided"))?;
                    let hash = hash_md5_password(&params.user, pass, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(anyhow!("SASL authentication not supported"));
                }
                backend::Message::ErrorResponse(_) => {
                    return Err(anyhow!("authentication rejected by server"));
                }
                _ => return Err(anyhow!("unexpected message during auth: {}", type_code)),
            }
        }

        // 3. Wait for ReadyForQuery
        loop {
            let (type_code, _) = read_message(&mut stream).await?;
            if type_code == b'Z' {
                debug!("ready for query");
                break;
            } else if type_code == b'E' {
                return Err(anyhow!("error waiting for ready"));
            }
        }

        Ok(Self { stream })
    }

    /// Create a logical replication slot using the test_decoding plugin.
    pub async fn create_replication_slot(&mut self, slot: &str) -> Result<()> {
        let query = format!("CREATE_REPLICATION_SLOT {} LOGICAL {}", slot, OUTPUT_PLUGIN);
        self.simple_query(&query).await
    }

    /// Drop a replication slot.
    pub async fn drop_replication_slot(&mut self, slot: &str) -> Result<()> {
        let query = format!("DROP_REPLICATION_SLOT {}", slot);
        self.simple_query(&query).await
    }

    /// Start streaming from the slot. The server resumes from the slot's
    /// confirmed position when the requested LSN is 0/0.
    pub async fn start_replication(mut self, slot: &str) -> Result<ReplicationStream> {
        let query = format!("START_REPLICATION SLOT {} LOGICAL 0/0", slot);

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        // Expect CopyBothResponse ('W')
        let (type_code, _) = read_message(&mut self.stream).await?;
        if type_code == b'W' {
            info!("entered CopyBoth mode on slot {}", slot);
            Ok(ReplicationStream {
                stream: self.stream,
                buf: BytesMut::with_capacity(8 * 1024),
            })
        } else if type_code == b'E' {
            Err(anyhow!("unable to start replication on slot {}", slot))
        } else {
            Err(anyhow!(
                "unexpected response to START_REPLICATION: {}",
                type_code as char
            ))
        }
    }

    async fn simple_query(&mut self, query: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        loop {
            let (type_code, _) = read_message(&mut self.stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => return Err(anyhow!("query failed: {}", query)),
                _ => {}
            }
        }
        Ok(())
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let type_code = stream.read_u8().await.context("failed to read type")?;
    let len = stream.read_i32().await.context("failed to read length")? as usize;
    if len < 4 {
        return Err(anyhow!("invalid message length {}", len));
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read body")?;
    Ok((type_code, body))
}

/// One frame of interest from the CopyBoth stream.
#[derive(Debug)]
pub enum ReplicationFrame {
    /// A logical decoding payload starting at `lsn`.
    XLogData { lsn: Lsn, data: Bytes },
    /// Server heartbeat; `reply_requested` asks for an immediate
    /// standby-status response.
    Keepalive { wal_end: Lsn, reply_requested: bool },
}

/// Replication stream in CopyBoth mode.
///
/// Reads are frame-buffered: bytes are accumulated with `read_buf` and
/// frames are cut out of the buffer once complete, so a receive deadline
/// can expire mid-frame without losing data. Deadline expiry is the
/// normal idle path, not an error.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
    buf: BytesMut,
}

impl ReplicationStream {
    /// Wait up to `deadline` for the next frame. Returns `Ok(None)` when
    /// the deadline expires.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Option<ReplicationFrame>> {
        let deadline = Instant::now() + deadline;
        loop {
            if let Some(frame) = self.take_frame()? {
                match classify_frame(frame)? {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }

            match timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(anyhow!("replication connection closed by server")),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e).context("failed to read replication stream"),
            }
        }
    }

    /// Cut one complete protocol frame out of the read buffer.
    fn take_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(anyhow!("invalid frame length {}", len));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }

    /// Send a standby-status frame acknowledging `lsn` as written,
    /// flushed, and applied.
    pub async fn send_standby_status(&mut self, lsn: Lsn) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn.0);
        payload.put_u64(lsn.0);
        payload.put_u64(lsn.0);
        payload.put_i64(pg_epoch_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.get_mut().write_all(&frame).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }
}

/// Map a protocol frame to a replication event; `None` for frames the
/// driver does not care about.
fn classify_frame(frame: Bytes) -> Result<Option<ReplicationFrame>> {
    let type_code = frame[0];
    let mut body = frame.slice(5..);

    match type_code {
        b'd' => {
            if !body.has_remaining() {
                return Ok(None);
            }
            match body.get_u8() {
                b'w' => {
                    if body.remaining() < 24 {
                        return Err(anyhow!("truncated XLogData frame"));
                    }
                    let wal_start = body.get_u64();
                    let _wal_end = body.get_u64();
                    let _ts = body.get_i64();
                    Ok(Some(ReplicationFrame::XLogData {
                        lsn: Lsn(wal_start),
                        data: body,
                    }))
                }
                b'k' => {
                    if body.remaining() < 17 {
                        return Err(anyhow!("truncated keepalive frame"));
                    }
                    let wal_end = body.get_u64();
                    let _ts = body.get_i64();
                    let reply_requested = body.get_u8() == 1;
                    Ok(Some(ReplicationFrame::Keepalive {
                        wal_end: Lsn(wal_end),
                        reply_requested,
                    }))
                }
                other => {
                    debug!("ignoring CopyData subtype {}", other as char);
                    Ok(None)
                }
            }
        }
        b'c' => Err(anyhow!("replication stream ended (CopyDone)")),
        b'E' => Err(anyhow!("error response on replication stream")),
        b'N' => Ok(None), // NoticeResponse
        other => Err(anyhow!("unexpected message type {}", other as char)),
    }
}

/// Microseconds since the PostgreSQL epoch (2000-01-01 00:00:00 UTC).
fn pg_epoch_micros() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn hash_md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    let second = hex::encode(hasher.finalize());

    format!("md5{}", second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_hash() {
        // Matches PostgreSQL's concat('md5', md5(password || user || salt)).
        let hash = hash_md5_password("postgres", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
    }

    #[test]
    fn test_pg_epoch_micros_is_positive() {
        assert!(pg_epoch_micros() > 0);
    }
}
