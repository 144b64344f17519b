//! Wire-Format des Signaling-Kanals
//!
//! Laengen-praefixierte JSON-Rahmen ueber TCP:
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE), ohne das Feld    | JSON       |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! Relay-Audio laeuft ueber denselben Kanal, deshalb ist das Limit
//! grosszuegig (Standard: 1 MB).

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::signal::KanalNachricht;

/// Standard-maximale Rahmengroesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer JSON-Rahmen
///
/// Standardmaessig fuer [`KanalNachricht`]; der Typparameter erlaubt
/// denselben Codec fuer Testserver mit eigenem Nachrichtentyp.
///
/// ```rust,no_run
/// use tokio_util::codec::Framed;
/// use klangraum_protocol::wire::FrameCodec;
///
/// // let stream = TcpStream::connect(...).await?;
/// // let framed = Framed::new(stream, FrameCodec::new());
/// ```
#[derive(Debug)]
pub struct FrameCodec<T = KanalNachricht> {
    max_frame_size: usize,
    _typ: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _typ: PhantomData,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_size(self.max_frame_size)
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn zu_gross(laenge: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Rahmen zu gross: {} Bytes (Maximum: {} Bytes)", laenge, max),
    )
}

fn json_lesen<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Deserialisierung fehlgeschlagen: {}", e),
        )
    })
}

fn json_schreiben<T: Serialize>(nachricht: &T, max: usize) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(nachricht).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Serialisierung fehlgeschlagen: {}", e),
        )
    })?;
    if json.len() > max {
        return Err(zu_gross(json.len(), max));
    }
    Ok(json)
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let laenge = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if laenge > self.max_frame_size {
            return Err(zu_gross(laenge, self.max_frame_size));
        }

        let gesamt = LENGTH_FIELD_SIZE + laenge;
        if src.len() < gesamt {
            src.reserve(gesamt - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let payload = src.split_to(laenge);
        json_lesen(&payload).map(Some)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = json_schreiben(&item, self.max_frame_size)?;
        dst.reserve(LENGTH_FIELD_SIZE + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Direktes async Lesen/Schreiben (ohne Framed)
// ---------------------------------------------------------------------------

/// Liest einen einzelnen Rahmen
///
/// # Fehler
/// - `UnexpectedEof` wenn die Verbindung mitten im Rahmen endet
/// - `InvalidData` bei ungueltigem JSON oder zu grossem Rahmen
pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: usize) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LENGTH_FIELD_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let laenge = u32::from_be_bytes(len_buf) as usize;
    if laenge > max_frame_size {
        return Err(zu_gross(laenge, max_frame_size));
    }

    let mut payload = vec![0u8; laenge];
    reader.read_exact(&mut payload).await?;
    json_lesen(&payload)
}

/// Schreibt einen einzelnen Rahmen
pub async fn write_frame<W, T>(writer: &mut W, nachricht: &T, max_frame_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = json_schreiben(nachricht, max_frame_size)?;
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
