//! RouterOS API word and sentence framing.
//!
//! A word is a length prefix followed by that many bytes. A sentence is a
//! sequence of words closed by a zero-length word.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::device::DeviceError;

/// Largest word accepted from a device.
pub const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a word length prefix.
///
/// # Errors
/// Returns `DeviceError::Protocol` for lengths that do not fit the 32-bit prefix.
pub fn encode_length(len: usize) -> Result<Vec<u8>, DeviceError> {
    let len = u32::try_from(len)
        .map_err(|_| DeviceError::Protocol(format!("word of {len} bytes cannot be encoded")))?;
    let encoded = if len < 0x80 {
        vec![len as u8]
    } else if len < 0x4000 {
        (len | 0x8000).to_be_bytes()[2..].to_vec()
    } else if len < 0x20_0000 {
        (len | 0xC0_0000).to_be_bytes()[1..].to_vec()
    } else if len < 0x1000_0000 {
        (len | 0xE000_0000).to_be_bytes().to_vec()
    } else {
        let mut out = vec![0xF0];
        out.extend_from_slice(&len.to_be_bytes());
        out
    };
    Ok(encoded)
}

/// Read a word length prefix.
pub async fn read_length<R>(reader: &mut R) -> Result<usize, DeviceError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    let (extra, mut len) = match first {
        b if b & 0x80 == 0x00 => (0, u32::from(b)),
        b if b & 0xC0 == 0x80 => (1, u32::from(b & 0x3F)),
        b if b & 0xE0 == 0xC0 => (2, u32::from(b & 0x1F)),
        b if b & 0xF0 == 0xE0 => (3, u32::from(b & 0x0F)),
        0xF0 => (4, 0),
        b => {
            return Err(DeviceError::Protocol(format!(
                "unsupported length prefix 0x{b:02X}"
            )));
        }
    };
    for _ in 0..extra {
        len = (len << 8) | u32::from(reader.read_u8().await?);
    }
    Ok(len as usize)
}

/// Write one sentence, including its terminating empty word.
///
/// Words carry credentials during login, so the staging buffer is sized up
/// front and wiped on drop. Words over [`MAX_WORD_LEN`] are rejected before
/// anything is written.
pub async fn write_sentence<W>(writer: &mut W, words: &[String]) -> Result<(), DeviceError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(word) = words.iter().find(|w| w.len() > MAX_WORD_LEN) {
        return Err(DeviceError::Protocol(format!(
            "word of {} bytes exceeds limit",
            word.len()
        )));
    }

    let size = words.iter().map(|w| w.len() + 5).sum::<usize>() + 1;
    let mut buf = Zeroizing::new(Vec::with_capacity(size));
    for word in words {
        buf.extend(encode_length(word.len())?);
        buf.extend_from_slice(word.as_bytes());
    }
    buf.push(0);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one sentence. The terminating empty word is not returned.
pub async fn read_sentence<R>(reader: &mut R) -> Result<Vec<String>, DeviceError>
where
    R: AsyncRead + Unpin,
{
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(DeviceError::Protocol(format!("word of {len} bytes exceeds limit")));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let word = String::from_utf8(buf)
            .map_err(|_| DeviceError::Protocol("word is not valid UTF-8".to_string()))?;
        words.push(word);
    }
}
