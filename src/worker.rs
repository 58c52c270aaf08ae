// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The volume worker: a synchronous loop that serves one read at a time.
//
// For each forwarded read it creates the named shared buffer (the client
// only reserved the name), paints it with the background colour, has the
// volume write the covered voxels straight into the mapping, drops the
// mapping without unlinking — the client's result handle is the sole unlink
// authority — and acknowledges. Failures are reported in the result record
// and the loop keeps running.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::BrokerError;
use crate::fill;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::transport::DealerSocket;
use crate::volume::Volume;
use crate::wire::{self, Payload, ReadParams, ReadResult, WorkerReady, WorkerRead};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Scheduler socket path.
    pub endpoint: PathBuf,
    /// Worker index within the cluster, used in the transport identity.
    pub index: usize,
    /// Fill/decompress thread hint, reported in `READY` and used to size
    /// the background fill.
    pub parallel: u32,
}

impl WorkerConfig {
    pub fn new(endpoint: impl Into<PathBuf>, index: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            index,
            parallel: 4,
        }
    }
}

pub struct VolumeWorker<V: Volume> {
    cfg: WorkerConfig,
    volume: V,
    identity: Vec<u8>,
    dealer: DealerSocket,
}

impl<V: Volume> VolumeWorker<V> {
    /// Connect to the scheduler and register.
    pub fn connect(cfg: WorkerConfig, volume: V) -> Result<Self, BrokerError> {
        let identity = format!("worker_{}_{}", cfg.index, std::process::id()).into_bytes();
        let mut dealer = DealerSocket::connect(&cfg.endpoint, &identity)?;
        dealer.send(&wire::encode(Payload::Ready(WorkerReady {
            parallel: cfg.parallel,
        })))?;
        info!(
            "{} registered with {} (parallel {})",
            String::from_utf8_lossy(&identity),
            cfg.endpoint.display(),
            cfg.parallel
        );
        Ok(Self {
            cfg,
            volume,
            identity,
            dealer,
        })
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Serve requests until the transport dies (the supervisor terminates
    /// workers by signal; there is no drain protocol).
    pub fn run(&mut self) -> Result<(), BrokerError> {
        loop {
            self.serve_one(None)?;
        }
    }

    /// Serve at most one request, waiting up to `timeout` for it to arrive.
    /// Returns `false` on timeout. Exposed for tests driving a worker from
    /// a thread.
    pub fn serve_one(&mut self, timeout: Option<Duration>) -> Result<bool, BrokerError> {
        let payload = match self.dealer.recv(timeout)? {
            Some(p) => p,
            None => return Ok(false),
        };
        match wire::decode(&payload) {
            Ok(Payload::WorkerRead(req)) => self.process(req),
            Ok(_) => warn!("worker: unexpected record type, discarded"),
            Err(e) => warn!("worker: undecodable datagram: {e}"),
        }
        Ok(true)
    }

    fn process(&mut self, req: WorkerRead) {
        let client_id = req.client_id;
        let read = match req.read {
            Some(r) => r,
            None => {
                warn!("worker: forwarded read without body, discarded");
                return;
            }
        };
        let req_id = read.req_id.clone();

        let result = match self.execute(&read) {
            Ok(()) => ReadResult::ok(&req_id, &client_id),
            Err(e) => {
                warn!("worker: request {req_id} failed: {e}");
                ReadResult::error(&req_id, &client_id, e.to_string())
            }
        };
        if let Err(e) = self.dealer.send(&wire::encode(Payload::Result(result))) {
            // Losing the scheduler is fatal; the next recv will error out too.
            warn!("worker: failed to send result for {req_id}: {e}");
        }
    }

    fn execute(&mut self, read: &wire::ClientRead) -> Result<(), BrokerError> {
        let params = read.params()?;
        let t0 = Instant::now();

        let shm = ShmHandle::acquire(&read.shm_name, params.data_size, ShmOpenMode::Create)
            .map_err(BrokerError::ShmCreate)?;
        let t1 = Instant::now();

        let res = self.render(&params, &shm);
        if res.is_err() {
            // A failed request must not leave the segment behind: the client
            // never gets a handle to unlink.
            shm.unlink();
            return res;
        }
        let t2 = Instant::now();

        debug!(
            "{}: prepare {:.1}ms, fill+read {:.1}ms",
            read.req_id,
            (t1 - t0).as_secs_f64() * 1e3,
            (t2 - t1).as_secs_f64() * 1e3,
        );
        Ok(())
    }

    fn render(&self, params: &ReadParams, shm: &ShmHandle) -> Result<(), BrokerError> {
        // Safety: the segment was created exclusively for this request; the
        // client does not touch it until our RESULT arrives.
        let buf = unsafe { shm.as_mut_slice() };

        let t0 = Instant::now();
        let threads = (self.cfg.parallel as usize) * 2;
        fill::fill_background(buf, params.dtype, params.bg_color, threads);
        let t1 = Instant::now();

        // The volume writes decompressed voxels directly into the mapping;
        // uncovered voxels keep the background value.
        self.volume.read_into(&params.bbox, params.order, buf)?;
        let t2 = Instant::now();

        debug!(
            "fill {:.1}ms, volume {:.1}ms ({})",
            (t1 - t0).as_secs_f64() * 1e3,
            (t2 - t1).as_secs_f64() * 1e3,
            params.bbox,
        );
        Ok(())
    }
}
