//! Length-prefixed framing helpers for talking to peers over TCP.

use std::marker::Unpin;

use crate::utils::NlmError;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single frame, guarding against garbage length prefixes.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// Writes an object of type `T` through given writable connection: first 8
/// bytes being the encoded length, and the rest bytes being the object
/// itself encoded in MessagePack.
pub(crate) async fn write_frame<T, Conn>(
    obj: &T,
    conn_write: &mut Conn,
) -> Result<(), NlmError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Reads an object of type `T` from given readable connection. Counterpart
/// of `write_frame()`.
pub(crate) async fn read_frame<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, NlmError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn_read.read_u64().await?; // receive length first
    if obj_len > MAX_FRAME_LEN {
        return logged_err!("frame length {} exceeds limit", obj_len);
    }

    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    let obj = decode_from_slice(&obj_buf)?;
    Ok(obj)
}
