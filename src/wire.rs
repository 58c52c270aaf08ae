// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire records for the broker control plane.
//
// One message struct per record type, wrapped in a tagged-union `Envelope`.
// Encoding is protobuf via prost derive — no schema compiler involved.
// Integers are 64-bit on the wire; identities are opaque byte strings.

use prost::Message;

use crate::dtype::{DType, Order};
use crate::error::BrokerError;
use crate::geom::BBox;

/// `READ` as sent by a client. The scheduler never forwards this directly;
/// it wraps it into a [`WorkerRead`] with the client identity injected.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientRead {
    /// `<pid>_req_<hex>`; the pid prefix is the affinity key.
    #[prost(string, tag = "1")]
    pub req_id: String,
    /// Half-open `[x1, y1, z1, x2, y2, z2]`.
    #[prost(int64, repeated, tag = "2")]
    pub bbox: Vec<i64>,
    /// `[dx, dy, dz, channels]`.
    #[prost(int64, repeated, tag = "3")]
    pub shape: Vec<i64>,
    #[prost(string, tag = "4")]
    pub dtype: String,
    /// Memory layout tag, `"F"` or `"C"`.
    #[prost(string, tag = "5")]
    pub order: String,
    /// Name of the shared buffer reserved for this request.
    #[prost(string, tag = "6")]
    pub shm_name: String,
    /// Total buffer size in bytes.
    #[prost(int64, tag = "7")]
    pub data_size: i64,
    /// Background value for voxels the volume leaves uncovered.
    #[prost(int64, tag = "8")]
    pub bg_color: i64,
}

/// `READ` as forwarded to a worker: the client record plus the transport
/// identity of the requester, injected by the scheduler.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRead {
    #[prost(message, optional, tag = "1")]
    pub read: Option<ClientRead>,
    #[prost(bytes = "vec", tag = "2")]
    pub client_id: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

/// `RESULT`, worker → scheduler → client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadResult {
    #[prost(string, tag = "1")]
    pub req_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub client_id: Vec<u8>,
    #[prost(enumeration = "Status", tag = "3")]
    pub status_code: i32,
    /// Worker-provided message; empty on success.
    #[prost(string, tag = "4")]
    pub error: String,
}

/// `READY`, worker → scheduler, sent once on startup. Re-registration is
/// a no-op on the scheduler side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerReady {
    /// Self-reported fill/decompress thread hint.
    #[prost(uint32, tag = "1")]
    pub parallel: u32,
}

/// Tagged union over all record types.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "1")]
    Read(ClientRead),
    #[prost(message, tag = "2")]
    WorkerRead(WorkerRead),
    #[prost(message, tag = "3")]
    Result(ReadResult),
    #[prost(message, tag = "4")]
    Ready(WorkerReady),
}

/// Encode a payload into a wire buffer.
pub fn encode(payload: Payload) -> Vec<u8> {
    Envelope { payload: Some(payload) }.encode_to_vec()
}

/// Decode a wire buffer into a payload.
pub fn decode(bytes: &[u8]) -> Result<Payload, BrokerError> {
    let env = Envelope::decode(bytes)?;
    env.payload
        .ok_or_else(|| BrokerError::Protocol("empty envelope".into()))
}

// ---------------------------------------------------------------------------
// Typed views over decoded records
// ---------------------------------------------------------------------------

/// A validated, typed view of a [`ClientRead`].
#[derive(Debug, Clone, Copy)]
pub struct ReadParams {
    pub bbox: BBox,
    pub channels: i64,
    pub dtype: DType,
    pub order: Order,
    pub data_size: usize,
    pub bg_color: u64,
}

impl ClientRead {
    /// Validate field arity, tags and size consistency; returns the typed
    /// parameters on success.
    pub fn params(&self) -> Result<ReadParams, BrokerError> {
        let bbox = BBox::from_flat(&self.bbox)
            .ok_or_else(|| BrokerError::Protocol(format!("bbox has {} entries", self.bbox.len())))?;
        if bbox.is_empty() {
            return Err(BrokerError::Protocol(format!("empty bbox {bbox}")));
        }
        if self.shape.len() != 4 {
            return Err(BrokerError::Protocol(format!(
                "shape has {} entries",
                self.shape.len()
            )));
        }
        let [dx, dy, dz] = bbox.shape();
        let channels = self.shape[3];
        if self.shape[..3] != [dx, dy, dz] || channels <= 0 {
            return Err(BrokerError::Protocol(format!(
                "shape {:?} inconsistent with bbox {bbox}",
                self.shape
            )));
        }
        let dtype = DType::parse(&self.dtype)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown dtype {:?}", self.dtype)))?;
        let order = Order::parse(&self.order)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown order {:?}", self.order)))?;

        let expected = dx * dy * dz * channels * dtype.size_of() as i64;
        if self.data_size != expected {
            return Err(BrokerError::Protocol(format!(
                "data_size {} does not match shape ({expected} expected)",
                self.data_size
            )));
        }

        Ok(ReadParams {
            bbox,
            channels,
            dtype,
            order,
            data_size: expected as usize,
            bg_color: self.bg_color as u64,
        })
    }
}

impl WorkerRead {
    /// Scheduler-side transformation: wrap a client record with the
    /// requester's transport identity.
    pub fn inject(read: ClientRead, client_id: &[u8]) -> Self {
        Self {
            read: Some(read),
            client_id: client_id.to_vec(),
        }
    }
}

impl ReadResult {
    pub fn ok(req_id: &str, client_id: &[u8]) -> Self {
        Self {
            req_id: req_id.to_string(),
            client_id: client_id.to_vec(),
            status_code: Status::Ok as i32,
            error: String::new(),
        }
    }

    pub fn error(req_id: &str, client_id: &[u8], message: String) -> Self {
        Self {
            req_id: req_id.to_string(),
            client_id: client_id.to_vec(),
            status_code: Status::Error as i32,
            error: message,
        }
    }

    /// Decoded status; unknown enum values read as `Error`.
    pub fn status(&self) -> Status {
        Status::try_from(self.status_code).unwrap_or(Status::Error)
    }
}
