//! Newline-delimited JSON protocol spoken between runners and the job.
//! Every record is a single UTF-8 JSON object terminated by `\n`.

pub mod messages;
pub mod task;

use std::io::{self, BufRead, Read, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound of a single record, guarding the reader against a peer that never sends `\n`.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

fn too_large() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "record exceeds maximum size")
}

fn encode<T: serde::Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Reads one record. Returns `None` on a clean end of stream.
pub fn read<T: serde::de::DeserializeOwned>(reader: &mut impl BufRead) -> io::Result<Option<T>> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_RECORD_SIZE as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_RECORD_SIZE {
            return Err(too_large());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(serde_json::from_slice(&line)?));
    }
}

/// Writes one record and flushes it.
pub fn write<T: serde::Serialize>(writer: &mut impl Write, msg: &T) -> io::Result<()> {
    writer.write_all(&encode(msg)?)?;
    writer.flush()
}

/// Like [read], for async readers.
pub async fn async_read<T, R>(reader: &mut R) -> io::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_RECORD_SIZE {
            return Err(too_large());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(serde_json::from_slice(&line)?));
    }
}

/// Like [write], for async writers.
pub async fn async_write<T, W>(writer: &mut W, msg: &T) -> io::Result<()>
where
    T: serde::Serialize,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(msg)?).await?;
    writer.flush().await
}

#[cfg(test)]
mod test {
    use super::{async_read, async_write, read, write};
    use serde_json::{json, Value};
    use std::io::Cursor;

    #[test]
    fn sync_lines() {
        let mut buf = Vec::new();
        write(&mut buf, &json!({"a": 1})).unwrap();
        write(&mut buf, &json!({"b": "x\ny"})).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = Cursor::new(buf);
        let first: Value = read(&mut reader).unwrap().unwrap();
        let second: Value = read(&mut reader).unwrap().unwrap();
        assert_eq!(first, json!({"a": 1}));
        assert_eq!(second, json!({"b": "x\ny"}));
        assert!(read::<Value>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut reader = Cursor::new(b"\n  \n{\"a\":2}\n".to_vec());
        let value: Value = read(&mut reader).unwrap().unwrap();
        assert_eq!(value, json!({"a": 2}));
    }

    #[test]
    fn garbage_is_an_error() {
        let mut reader = Cursor::new(b"not json\n".to_vec());
        assert!(read::<Value>(&mut reader).is_err());
    }

    #[tokio::test]
    async fn async_lines() {
        let mut buf = Vec::new();
        async_write(&mut buf, &json!([1, 2])).await.unwrap();
        let mut reader = tokio::io::BufReader::new(&buf[..]);
        let value: Value = async_read(&mut reader).await.unwrap().unwrap();
        assert_eq!(value, json!([1, 2]));
        assert!(async_read::<Value, _>(&mut reader).await.unwrap().is_none());
    }
}
