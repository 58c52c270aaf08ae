// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The client-side request front-end.
//
// `read` sizes the request, reserves a unique shared-buffer name, dispatches
// a READ record and blocks for the matching RESULT. The returned
// `VolumeArray` owns the attached buffer; releasing it unlinks the segment.
// Whenever a dispatched read does not end in a valid array — timeout, worker
// error, attach failure — the client unlinks the buffer before surfacing the
// error, so nothing leaks into the shared-memory namespace.

use std::ops::Range;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::debug;
use uuid::Uuid;

use crate::array::VolumeArray;
use crate::dtype::Order;
use crate::error::BrokerError;
use crate::geom::BBox;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;
use crate::transport::DealerSocket;
use crate::volume::Volume;
use crate::wire::{self, ClientRead, Payload, ReadResult, Status};

/// Requests below this many elements skip the broker and read locally.
/// The bypass only avoids per-request overhead; the right value is a
/// deployment tradeoff.
pub const DEFAULT_SHM_THRESHOLD: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheduler socket path.
    pub endpoint: PathBuf,
    /// Element-count threshold for the small-request bypass.
    pub shm_threshold: u64,
    /// How long to wait for a RESULT before giving up.
    pub timeout: Duration,
    /// Memory layout of returned arrays.
    pub order: Order,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            shm_threshold: DEFAULT_SHM_THRESHOLD,
            timeout: Duration::from_secs(60),
            order: Order::F,
        }
    }
}

/// Per-process front-end: one long-lived connection to the scheduler.
pub struct ClientProxy<V: Volume> {
    cfg: ClientConfig,
    volume: V,
    dealer: DealerSocket,
}

impl<V: Volume> ClientProxy<V> {
    /// Connect to the scheduler. The local volume handle serves metadata
    /// and the small-request bypass.
    pub fn connect(cfg: ClientConfig, volume: V) -> Result<Self, BrokerError> {
        let identity = format!(
            "{}_client_{}",
            std::process::id(),
            Uuid::new_v4().as_simple()
        );
        let dealer = DealerSocket::connect(&cfg.endpoint, identity.as_bytes())?;
        Ok(Self {
            cfg,
            volume,
            dealer,
        })
    }

    /// Adjust the result timeout for subsequent reads.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.cfg.timeout = timeout;
    }

    /// Read the sub-volume covered by three half-open ranges.
    pub fn read(&mut self, ranges: [Range<i64>; 3]) -> Result<VolumeArray, BrokerError> {
        let bbox = BBox::from_ranges(&ranges);
        if bbox.is_empty() {
            return Err(BrokerError::EmptyShape);
        }

        let meta = self.volume.meta().clone();
        let [dx, dy, dz] = bbox.shape();
        let channels = meta.num_channels as i64;
        let elements = dx * dy * dz * channels;
        let shape = [dx as usize, dy as usize, dz as usize, channels as usize];

        if (elements as u64) < self.cfg.shm_threshold {
            // Trivially small read: call the volume locally, no broker, no
            // shared memory.
            let buf = self.volume.read(&bbox, self.cfg.order)?;
            return VolumeArray::from_heap(buf, shape, meta.data_type, self.cfg.order);
        }

        let req_id = shm_name::unique_req_id();
        let shm = shm_name::unique_shm_name();
        let data_size = elements * meta.data_type.size_of() as i64;

        let read = ClientRead {
            req_id: req_id.clone(),
            bbox: bbox.to_flat().to_vec(),
            shape: vec![dx, dy, dz, channels],
            dtype: meta.data_type.as_str().into(),
            order: self.cfg.order.as_str().into(),
            shm_name: shm.clone(),
            data_size,
            bg_color: meta.background_color as i64,
        };
        self.dealer.send(&wire::encode(Payload::Read(read)))?;

        // From here on the worker may have created the buffer; every failure
        // path must unlink the name before surfacing.
        let result = match self.await_result(&req_id) {
            Ok(r) => r,
            Err(e) => {
                ShmHandle::unlink_by_name(&shm);
                return Err(e);
            }
        };

        if result.status() == Status::Error {
            ShmHandle::unlink_by_name(&shm);
            return Err(BrokerError::Worker(result.error));
        }

        let handle = match ShmHandle::acquire(&shm, data_size as usize, ShmOpenMode::Open) {
            Ok(h) => h,
            Err(e) => {
                ShmHandle::unlink_by_name(&shm);
                return Err(BrokerError::ShmAttach(e));
            }
        };
        // from_shm unlinks itself when the segment size is inconsistent.
        VolumeArray::from_shm(handle, shape, meta.data_type, self.cfg.order)
    }

    /// Block until the RESULT for `req_id` arrives. Results for other
    /// request ids are stale leftovers from timed-out requests on this
    /// connection — skipped, never an error.
    fn await_result(&mut self, req_id: &str) -> Result<ReadResult, BrokerError> {
        let deadline = Instant::now() + self.cfg.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::Timeout);
            }
            let payload = match self.dealer.recv(Some(remaining))? {
                Some(p) => p,
                None => return Err(BrokerError::Timeout),
            };
            match wire::decode(&payload) {
                Ok(Payload::Result(r)) if r.req_id == req_id => return Ok(r),
                Ok(Payload::Result(r)) => {
                    debug!("client: skipping stale result for {}", r.req_id);
                }
                Ok(_) => debug!("client: unexpected record type, skipped"),
                Err(e) => debug!("client: skipping undecodable datagram: {e}"),
            }
        }
    }
}
