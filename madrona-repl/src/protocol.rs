//! Wire frames and payloads of the replication protocol.
//!
//! A connection carries [`Frame`]s: numbered requests tagged with a profile,
//! numbered responses, and a final close frame. The frame envelope is
//! postcard behind a big-endian `u32` length prefix; profile payloads that
//! the protocol defines as JSON (`subChanges` bodies, `changes` rows, `rev`
//! headers) travel as JSON inside the frame body. Binary content (revision
//! bodies, blobs) rides in a separate payload field, deflate-compressed
//! once it reaches [`MIN_LENGTH_TO_COMPRESS`].

use std::fmt;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use madrona::{Error, Result};

/// Upper bound on one encoded frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bodies at or above this many bytes are deflate-compressed in transit.
pub const MIN_LENGTH_TO_COMPRESS: usize = 100;

/// Request profiles used by the replicator core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    #[serde(rename = "subChanges")]
    SubChanges,
    #[serde(rename = "changes")]
    Changes,
    #[serde(rename = "rev")]
    Rev,
    #[serde(rename = "getAttachment")]
    GetAttachment,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Profile::SubChanges => "subChanges",
            Profile::Changes => "changes",
            Profile::Rev => "rev",
            Profile::GetAttachment => "getAttachment",
        };
        f.write_str(name)
    }
}

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Close(Goodbye),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub num: u64,
    pub profile: Profile,
    /// JSON-encoded profile payload.
    pub body: Bytes,
    /// Binary attachment (revision body, blob contents).
    pub payload: Bytes,
    /// Whether `payload` is deflate-compressed.
    pub compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub num: u64,
    pub result: ResponseResult,
}

/// A response either carries a body (and optional binary payload), or a
/// structured `{domain, code, message}` error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseResult {
    Ok {
        body: Bytes,
        payload: Bytes,
        compressed: bool,
    },
    Err(Error),
}

/// The close frame: a status code plus optional human-readable reason. On a
/// raw WebSocket this is carried as the standard close payload, two bytes of
/// big-endian status followed by UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    pub status: u16,
    pub reason: String,
}

impl Goodbye {
    pub fn normal() -> Self {
        Goodbye {
            status: 1000,
            reason: String::new(),
        }
    }

    /// Encodes the WebSocket close payload form.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.reason.len());
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(self.reason.as_bytes());
        out
    }

    /// Decodes a WebSocket close payload. An empty payload maps to status 0.
    pub fn decode_payload(data: &[u8]) -> Result<Goodbye> {
        if data.is_empty() {
            return Ok(Goodbye {
                status: 0,
                reason: String::new(),
            });
        }
        if data.len() < 2 {
            return Err(Error::corrupt_data("close payload shorter than a status"));
        }
        let status = u16::from_be_bytes([data[0], data[1]]);
        let reason = std::str::from_utf8(&data[2..])
            .map_err(|_| Error::corrupt_data("close reason is not UTF-8"))?
            .to_string();
        Ok(Goodbye { status, reason })
    }
}

/// `subChanges` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubChanges {
    pub since: u64,
    pub continuous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<u32>,
}

/// One row of a `changes` request:
/// `[sequence, docID, revID, deleted, bodySize]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow(pub u64, pub String, pub String, pub bool, pub u64);

impl ChangeRow {
    pub fn sequence(&self) -> u64 {
        self.0
    }

    pub fn doc_id(&self) -> &str {
        &self.1
    }

    pub fn rev_id(&self) -> &str {
        &self.2
    }

    pub fn deleted(&self) -> bool {
        self.3
    }
}

/// Per-row entry of a `changes` response: `0` when the peer does not want
/// the revision, otherwise a list of possible-ancestor revision ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeAnswer {
    NotWanted(u8),
    Ancestors(Vec<String>),
}

impl ChangeAnswer {
    pub fn not_wanted() -> Self {
        ChangeAnswer::NotWanted(0)
    }

    pub fn wanted(&self) -> Option<&[String]> {
        match self {
            ChangeAnswer::NotWanted(_) => None,
            ChangeAnswer::Ancestors(ancestors) => Some(ancestors),
        }
    }
}

/// `rev` request headers; the document body travels in the frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevHeader {
    pub id: String,
    pub rev: String,
    pub sequence: u64,
    pub deleted: bool,
    pub history: Vec<String>,
}

/// `getAttachment` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAttachment {
    pub digest: String,
}

/// Length-prefixed postcard codec for [`Frame`]s over a byte stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len_bytes: [u8; 4] = src[..4].try_into().expect("sliced 4 bytes");
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(Error::corrupt_data(format!(
                "frame of {frame_len} bytes exceeds the limit"
            )));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let frame = decode_frame(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let encoded = encode_frame(&item)?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(Error::corrupt_data(format!(
                "frame of {} bytes exceeds the limit",
                encoded.len()
            )));
        }
        dst.reserve(4 + encoded.len());
        dst.put_u32(encoded.len() as u32);
        dst.put_slice(&encoded);
        Ok(())
    }
}

/// Encodes a frame without the length prefix (the form carried inside a
/// WebSocket binary message).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    postcard::to_stdvec(frame).map_err(|err| Error::corrupt_data(err))
}

/// Inverse of [`encode_frame`].
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    postcard::from_bytes(data).map_err(|err| Error::corrupt_data(err))
}

/// Serializes a profile payload as JSON body bytes.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(serde_json::to_vec(value)?.into())
}

/// Parses a JSON body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Deflates `data` when it is large enough to be worth it.
pub fn maybe_compress(data: Bytes) -> Result<(Bytes, bool)> {
    if data.len() < MIN_LENGTH_TO_COMPRESS {
        return Ok((data, false));
    }
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&data)?;
    Ok((encoder.finish()?.into(), true))
}

/// Undoes [`maybe_compress`].
pub fn decompress_if(data: Bytes, compressed: bool) -> Result<Bytes> {
    if !compressed {
        return Ok(data);
    }
    let mut decoder = flate2::read::DeflateDecoder::new(data.as_ref());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| Error::corrupt_data("invalid compressed payload"))?;
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_rows_are_json_arrays() {
        let row = ChangeRow(7, "doc".into(), "2-bb".into(), false, 42);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[7,"doc","2-bb",false,42]"#);
        let back: ChangeRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn change_answers_are_zero_or_arrays() {
        let answers = vec![
            ChangeAnswer::not_wanted(),
            ChangeAnswer::Ancestors(vec!["1-aa".into(), "2-bb".into()]),
        ];
        let json = serde_json::to_string(&answers).unwrap();
        assert_eq!(json, r#"[0,["1-aa","2-bb"]]"#);
        let back: Vec<ChangeAnswer> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, answers);
        assert!(back[0].wanted().is_none());
        assert_eq!(back[1].wanted().unwrap().len(), 2);
    }

    #[test]
    fn frame_codec_round_trip() {
        let frames = vec![
            Frame::Request(Request {
                num: 1,
                profile: Profile::Changes,
                body: Bytes::from_static(b"[[1,\"d\",\"1-a\",false,2]]"),
                payload: Bytes::new(),
                compressed: false,
            }),
            Frame::Response(Response {
                num: 1,
                result: ResponseResult::Ok {
                    body: Bytes::from_static(b"[0]"),
                    payload: Bytes::from_static(b"\x01\x02"),
                    compressed: false,
                },
            }),
            Frame::Response(Response {
                num: 2,
                result: ResponseResult::Err(Error::conflict("already exists")),
            }),
            Frame::Close(Goodbye {
                status: 1000,
                reason: "done".into(),
            }),
        ];

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded.len(), frames.len());
        match (&decoded[0], &frames[0]) {
            (Frame::Request(a), Frame::Request(b)) => {
                assert_eq!(a.num, b.num);
                assert_eq!(a.profile, b.profile);
                assert_eq!(a.body, b.body);
            }
            _ => panic!("frame kind mismatch"),
        }
        match &decoded[2] {
            Frame::Response(r) => match &r.result {
                ResponseResult::Err(err) => assert_eq!(err.http_status(), 409),
                _ => panic!("expected error result"),
            },
            _ => panic!("frame kind mismatch"),
        }
        match &decoded[3] {
            Frame::Close(g) => assert_eq!(g.status, 1000),
            _ => panic!("frame kind mismatch"),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Close(Goodbye::normal()), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn close_payload_round_trip() {
        let goodbye = Goodbye {
            status: 1001,
            reason: "going away".into(),
        };
        let payload = goodbye.encode_payload();
        assert_eq!(&payload[..2], &[0x03, 0xe9]);
        assert_eq!(Goodbye::decode_payload(&payload).unwrap(), goodbye);
        assert_eq!(Goodbye::decode_payload(&[]).unwrap().status, 0);
        assert!(Goodbye::decode_payload(&[0x03]).is_err());
    }

    #[test]
    fn compression_threshold() {
        let small = Bytes::from_static(b"tiny");
        let (out, compressed) = maybe_compress(small.clone()).unwrap();
        assert!(!compressed);
        assert_eq!(out, small);

        let big = Bytes::from(vec![b'a'; 4096]);
        let (out, compressed) = maybe_compress(big.clone()).unwrap();
        assert!(compressed);
        assert!(out.len() < big.len());
        assert_eq!(decompress_if(out, true).unwrap(), big);
    }
}
