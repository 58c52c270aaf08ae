// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The spatial scheduler: a single-threaded event loop that registers
// workers, routes client reads to them and relays results back.
//
// `SchedulerCore` is the routing state machine — no sockets, fully
// deterministic, exercised directly by the tests. `Scheduler` wires it to a
// `RouterSocket` and is the long-running process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::BrokerError;
use crate::geom::{intersection_volume, morton_cell, BBox};
use crate::shm_name;
use crate::transport::RouterSocket;
use crate::wire::{self, ClientRead, Payload, ReadResult, WorkerRead};

/// Opaque transport identity of a worker or client.
pub type Identity = Vec<u8>;

/// Worker-selection strategy. The three coexist because they trade cache
/// affinity against load balance differently; `Affinity` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Ignore history, cycle through workers.
    RoundRobin,
    /// Pin each client process to a worker while that worker stays within
    /// a load tolerance of the least-loaded one.
    Affinity,
    /// Prefer the worker whose recent requests overlap this one; fall back
    /// to a Morton hash of the request centre.
    Spatial,
}

impl Strategy {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "round-robin" => Some(Strategy::RoundRobin),
            "affinity" => Some(Strategy::Affinity),
            "spatial" => Some(Strategy::Spatial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    /// Recent-bbox history kept per worker for spatial routing.
    pub history_len: usize,
    /// How far above the minimum load a pinned worker may sit before the
    /// affinity strategy rebalances away from it.
    pub load_tolerance: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Affinity,
            history_len: 5,
            load_tolerance: 2,
        }
    }
}

/// Scheduler-side state for one live worker.
#[derive(Debug)]
pub struct WorkerState {
    history: VecDeque<BBox>,
    load: u32,
    parallel: u32,
}

impl WorkerState {
    /// Outstanding requests dispatched but not yet acknowledged.
    pub fn load(&self) -> u32 {
        self.load
    }

    pub fn parallel(&self) -> u32 {
        self.parallel
    }

    pub fn history(&self) -> impl Iterator<Item = &BBox> {
        self.history.iter()
    }
}

/// A routing decision: forward `message` to `worker`.
#[derive(Debug)]
pub struct Dispatch {
    pub worker: Identity,
    pub message: WorkerRead,
}

// ---------------------------------------------------------------------------
// SchedulerCore
// ---------------------------------------------------------------------------

/// The routing state machine. All tables live in this one struct, owned by
/// the event loop; nothing here is shared or locked.
pub struct SchedulerCore {
    cfg: SchedulerConfig,
    workers: BTreeMap<Identity, WorkerState>,
    /// Affinity key → pinned worker.
    process_map: HashMap<String, Identity>,
    rr_cursor: usize,
    /// Reads that arrived before any worker registered.
    pending: VecDeque<(Identity, ClientRead)>,
}

impl SchedulerCore {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            cfg,
            workers: BTreeMap::new(),
            process_map: HashMap::new(),
            rr_cursor: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn worker(&self, id: &[u8]) -> Option<&WorkerState> {
        self.workers.get(id)
    }

    /// Register a worker. Idempotent: re-registration changes nothing.
    /// Returns the dispatches for any reads that were waiting for a worker.
    pub fn handle_ready(&mut self, worker: &[u8], parallel: u32) -> Vec<Dispatch> {
        if !self.workers.contains_key(worker) {
            self.workers.insert(
                worker.to_vec(),
                WorkerState {
                    history: VecDeque::with_capacity(self.cfg.history_len),
                    load: 0,
                    parallel,
                },
            );
        }

        let mut flushed = Vec::new();
        while let Some((client, read)) = self.pending.pop_front() {
            match self.dispatch(client, read) {
                Some(d) => flushed.push(d),
                None => break, // cannot happen while a worker is registered
            }
        }
        flushed
    }

    /// Route a read. `None` means no worker is registered yet — the read is
    /// queued, not dropped, and will flush on the first `READY`.
    pub fn handle_read(&mut self, client: &[u8], read: ClientRead) -> Option<Dispatch> {
        if self.workers.is_empty() {
            self.pending.push_back((client.to_vec(), read));
            return None;
        }
        self.dispatch(client.to_vec(), read)
    }

    /// Account a worker's result: decrement its load, saturating at zero.
    pub fn handle_result(&mut self, worker: &[u8], _result: &ReadResult) {
        if let Some(st) = self.workers.get_mut(worker) {
            st.load = st.load.saturating_sub(1);
        }
    }

    /// Forget a worker whose connection is gone. Affinity entries pointing
    /// at it fall back to least-loaded on their next request.
    pub fn purge_worker(&mut self, worker: &[u8]) {
        self.workers.remove(worker);
        self.process_map.retain(|_, w| w.as_slice() != worker);
    }

    fn dispatch(&mut self, client: Identity, read: ClientRead) -> Option<Dispatch> {
        let worker = self.select_worker(&read)?;
        let st = self.workers.get_mut(&worker).expect("selected live worker");
        st.load += 1;
        if let Some(bbox) = BBox::from_flat(&read.bbox) {
            if st.history.len() == self.cfg.history_len {
                st.history.pop_front();
            }
            st.history.push_back(bbox);
        }
        debug!(
            "route {} -> {} (load {})",
            read.req_id,
            String::from_utf8_lossy(&worker),
            st.load
        );
        Some(Dispatch {
            message: WorkerRead::inject(read, &client),
            worker,
        })
    }

    fn select_worker(&mut self, read: &ClientRead) -> Option<Identity> {
        match self.cfg.strategy {
            Strategy::RoundRobin => self.route_round_robin(),
            Strategy::Affinity => self.route_affinity(read),
            Strategy::Spatial => self.route_spatial(read),
        }
    }

    /// Least-loaded worker; ties break by identity order (the worker map is
    /// ordered, so the scan is stable).
    fn least_loaded(&self) -> Option<Identity> {
        self.workers
            .iter()
            .min_by_key(|(id, st)| (st.load, id.as_slice()))
            .map(|(id, _)| id.clone())
    }

    fn route_round_robin(&mut self) -> Option<Identity> {
        let n = self.workers.len();
        if n == 0 {
            return None;
        }
        let idx = self.rr_cursor % n;
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        self.workers.keys().nth(idx).cloned()
    }

    fn route_affinity(&mut self, read: &ClientRead) -> Option<Identity> {
        let key = shm_name::affinity_key(&read.req_id).to_string();
        let min_load = self.workers.values().map(|w| w.load).min()?;

        // Keep the pin while the pinned worker is alive and not trailing the
        // least-loaded one by more than the tolerance.
        if let Some(pinned) = self.process_map.get(&key) {
            if let Some(st) = self.workers.get(pinned) {
                if st.load <= min_load + self.cfg.load_tolerance {
                    return Some(pinned.clone());
                }
            }
        }

        let best = self.least_loaded()?;
        self.process_map.insert(key, best.clone());
        Some(best)
    }

    fn route_spatial(&mut self, read: &ClientRead) -> Option<Identity> {
        let bbox = match BBox::from_flat(&read.bbox) {
            Some(b) => b,
            None => return self.least_loaded(), // malformed bbox still routes
        };

        let mut best: Option<(i64, Identity)> = None;
        for (id, st) in &self.workers {
            let overlap: i64 = st
                .history
                .iter()
                .map(|h| intersection_volume(&bbox, h))
                .sum();
            // Strict > keeps the first (lowest identity) worker on ties.
            if overlap > 0 && best.as_ref().map_or(true, |(o, _)| overlap > *o) {
                best = Some((overlap, id.clone()));
            }
        }
        if let Some((_, id)) = best {
            return Some(id);
        }

        let n = self.workers.len();
        if n == 0 {
            return None;
        }
        let slot = (morton_cell(&bbox) % n as u64) as usize;
        self.workers.keys().nth(slot).cloned()
    }
}

// ---------------------------------------------------------------------------
// Scheduler — event loop
// ---------------------------------------------------------------------------

/// The scheduler process: one router socket, one routing core, one loop.
pub struct Scheduler {
    core: SchedulerCore,
    router: RouterSocket,
}

impl Scheduler {
    pub fn bind<P: AsRef<Path>>(path: P, cfg: SchedulerConfig) -> Result<Self, BrokerError> {
        let router = RouterSocket::bind(path)?;
        info!("scheduler listening on {}", router.path().display());
        Ok(Self {
            core: SchedulerCore::new(cfg),
            router,
        })
    }

    pub fn path(&self) -> &Path {
        self.router.path()
    }

    /// Run forever. Only a transport-level failure exits the loop; it is
    /// fatal to this process and the supervisor restarts it.
    pub fn run(&mut self) -> Result<(), BrokerError> {
        loop {
            self.step()?;
        }
    }

    /// Process one inbound datagram. Split out from [`run`](Scheduler::run)
    /// so tests can drive the loop a message at a time.
    pub fn step(&mut self) -> Result<(), BrokerError> {
        let (identity, payload) = self.router.recv()?;
        self.handle(identity, &payload);
        Ok(())
    }

    /// Like [`step`](Scheduler::step) with a bounded wait. Returns `false`
    /// when nothing arrived in time.
    pub fn step_timeout(&mut self, timeout: Duration) -> Result<bool, BrokerError> {
        match self.router.recv_timeout(timeout)? {
            Some((identity, payload)) => {
                self.handle(identity, &payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle(&mut self, identity: Identity, payload: &[u8]) {
        let payload = match wire::decode(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "undecodable datagram from {}: {e}",
                    String::from_utf8_lossy(&identity)
                );
                return;
            }
        };

        match payload {
            Payload::Ready(r) => {
                info!(
                    "worker registered: {} (parallel {})",
                    String::from_utf8_lossy(&identity),
                    r.parallel
                );
                for d in self.core.handle_ready(&identity, r.parallel) {
                    self.forward(d);
                }
            }
            Payload::Read(read) => match self.core.handle_read(&identity, read) {
                Some(d) => self.forward(d),
                None => info!(
                    "no workers registered; queued read ({} pending)",
                    self.core.pending_count()
                ),
            },
            Payload::Result(res) => {
                self.core.handle_result(&identity, &res);
                let client = res.client_id.clone();
                let buf = wire::encode(Payload::Result(res));
                if !self.router.send(&client, &buf) {
                    // The client timed out and went away; results are not
                    // replayed.
                    debug!(
                        "client {} gone, result dropped",
                        String::from_utf8_lossy(&client)
                    );
                }
            }
            Payload::WorkerRead(_) => {
                warn!(
                    "unexpected worker-read from {}, discarded",
                    String::from_utf8_lossy(&identity)
                );
            }
        }
    }

    fn forward(&mut self, d: Dispatch) {
        let buf = wire::encode(Payload::WorkerRead(d.message));
        if !self.router.send(&d.worker, &buf) {
            // No retry: at most one worker per request. The client's timeout
            // covers the loss.
            warn!(
                "worker {} unreachable, purging",
                String::from_utf8_lossy(&d.worker)
            );
            self.core.purge_worker(&d.worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn read_for(pid: u32, bbox: BBox) -> ClientRead {
        let [dx, dy, dz] = bbox.shape();
        ClientRead {
            req_id: format!("{pid}_req_{:08x}", bbox.x1 as u32 ^ bbox.y2 as u32),
            bbox: bbox.to_flat().to_vec(),
            shape: vec![dx, dy, dz, 1],
            dtype: DType::U8.as_str().into(),
            order: "F".into(),
            shm_name: format!("{pid}_shm_x"),
            data_size: dx * dy * dz,
            bg_color: 0,
        }
    }

    fn core(strategy: Strategy) -> SchedulerCore {
        SchedulerCore::new(SchedulerConfig {
            strategy,
            ..SchedulerConfig::default()
        })
    }

    const BOX_A: BBox = BBox::new(0, 0, 0, 10, 10, 10);

    #[test]
    fn ready_is_idempotent() {
        let mut c = core(Strategy::Affinity);
        assert!(c.handle_ready(b"worker_0_1", 4).is_empty());
        assert!(c.handle_ready(b"worker_0_1", 4).is_empty());
        assert_eq!(c.worker_count(), 1);
        assert_eq!(c.worker(b"worker_0_1").unwrap().parallel(), 4);
    }

    #[test]
    fn read_before_ready_is_deferred_not_dropped() {
        let mut c = core(Strategy::Affinity);
        assert!(c.handle_read(b"client_a", read_for(1, BOX_A)).is_none());
        assert!(c.handle_read(b"client_a", read_for(1, BOX_A)).is_none());
        assert_eq!(c.pending_count(), 2);

        let flushed = c.handle_ready(b"worker_0_1", 4);
        assert_eq!(flushed.len(), 2);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.worker(b"worker_0_1").unwrap().load(), 2);
    }

    #[test]
    fn dispatch_injects_client_identity() {
        let mut c = core(Strategy::RoundRobin);
        c.handle_ready(b"w0", 1);
        let d = c.handle_read(b"client_xyz", read_for(1, BOX_A)).unwrap();
        assert_eq!(d.message.client_id, b"client_xyz");
        assert_eq!(d.message.read.unwrap().req_id, read_for(1, BOX_A).req_id);
    }

    #[test]
    fn round_robin_cycles() {
        let mut c = core(Strategy::RoundRobin);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);
        c.handle_ready(b"w2", 1);
        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(c.handle_read(b"cl", read_for(1, BOX_A)).unwrap().worker);
        }
        assert_eq!(order[0], order[3]);
        assert_eq!(order[1], order[4]);
        assert_eq!(order[2], order[5]);
        assert_ne!(order[0], order[1]);
        assert_ne!(order[1], order[2]);
    }

    #[test]
    fn affinity_sticks_within_tolerance() {
        let mut c = core(Strategy::Affinity);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);

        let first = c.handle_read(b"cl", read_for(77, BOX_A)).unwrap().worker;
        // Same process keeps landing on the same worker while its load stays
        // within tolerance (all results acknowledged in between).
        for _ in 0..9 {
            let d = c.handle_read(b"cl", read_for(77, BOX_A)).unwrap();
            assert_eq!(d.worker, first);
            c.handle_result(&d.worker, &ReadResult::ok("x", b"cl"));
        }
    }

    #[test]
    fn affinity_separates_processes_by_load() {
        let mut c = core(Strategy::Affinity);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);

        // Process 1 pins a worker and accumulates load, so process 2 must be
        // pinned to the other (least-loaded) worker.
        let w_p1 = c.handle_read(b"c1", read_for(1, BOX_A)).unwrap().worker;
        for _ in 0..2 {
            assert_eq!(c.handle_read(b"c1", read_for(1, BOX_A)).unwrap().worker, w_p1);
        }
        let w_p2 = c.handle_read(b"c2", read_for(2, BOX_A)).unwrap().worker;
        assert_ne!(w_p1, w_p2);
    }

    #[test]
    fn affinity_rebalances_when_pinned_worker_is_busy() {
        let mut c = core(Strategy::Affinity);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);

        let pinned = c.handle_read(b"cl", read_for(9, BOX_A)).unwrap().worker;
        // Load the pinned worker up to min_load + tolerance (other stays 0).
        for _ in 0..2 {
            assert_eq!(c.handle_read(b"cl", read_for(9, BOX_A)).unwrap().worker, pinned);
        }
        // load(pinned) = 3 > 0 + 2: the next read rebalances to the idle worker.
        let moved = c.handle_read(b"cl", read_for(9, BOX_A)).unwrap().worker;
        assert_ne!(moved, pinned);
        // The pin follows the move.
        let again = c.handle_read(b"cl", read_for(9, BOX_A)).unwrap().worker;
        assert_eq!(again, moved);
    }

    #[test]
    fn spatial_prefers_overlapping_history() {
        let mut c = core(Strategy::Spatial);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);

        // Seed w1 with history around (0..100)^2 x (0..10).
        let seed = BBox::new(0, 0, 0, 100, 100, 10);
        // Route a request that only w1's history overlaps. First give w1 the
        // seed via a morton-routed read, then check the overlap path.
        let d = c.handle_read(b"cl", read_for(1, seed)).unwrap();
        let seeded = d.worker.clone();

        let overlapping = BBox::new(50, 50, 0, 150, 150, 10);
        let d2 = c.handle_read(b"cl", read_for(1, overlapping)).unwrap();
        assert_eq!(d2.worker, seeded);
    }

    #[test]
    fn spatial_morton_fallback_is_deterministic() {
        let mut c = core(Strategy::Spatial);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);
        c.handle_ready(b"w2", 1);

        let far = BBox::new(100_000, 100_000, 100_000, 100_010, 100_010, 100_010);
        let first = c.handle_read(b"cl", read_for(1, far)).unwrap().worker;
        // With no overlap the Morton hash decides; an identical request from
        // a fresh core lands on the same worker.
        let mut c2 = core(Strategy::Spatial);
        c2.handle_ready(b"w0", 1);
        c2.handle_ready(b"w1", 1);
        c2.handle_ready(b"w2", 1);
        // Drop the history the first routing recorded: route from c2 directly.
        let second = c2.handle_read(b"cl", read_for(1, far)).unwrap().worker;
        assert_eq!(first, second);
    }

    #[test]
    fn result_decrements_load_saturating() {
        let mut c = core(Strategy::RoundRobin);
        c.handle_ready(b"w0", 1);
        let d = c.handle_read(b"cl", read_for(1, BOX_A)).unwrap();
        assert_eq!(c.worker(b"w0").unwrap().load(), 1);
        c.handle_result(&d.worker, &ReadResult::ok("x", b"cl"));
        assert_eq!(c.worker(b"w0").unwrap().load(), 0);
        // A stray extra result must not underflow.
        c.handle_result(&d.worker, &ReadResult::ok("x", b"cl"));
        assert_eq!(c.worker(b"w0").unwrap().load(), 0);
    }

    #[test]
    fn load_conservation_over_random_trace() {
        // xorshift64 — deterministic trace generator.
        let mut state = 0x9E3779B97F4A7C15u64;
        let mut rng = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for &nworkers in &[1usize, 2, 5, 16] {
            let mut c = core(Strategy::Affinity);
            let ids: Vec<Vec<u8>> =
                (0..nworkers).map(|i| format!("w{i:02}").into_bytes()).collect();
            for id in &ids {
                c.handle_ready(id, (rng() % 8 + 1) as u32);
            }

            let mut in_flight: Vec<(Identity, ReadResult)> = Vec::new();
            let mut dispatched = 0u32;
            let mut acked = 0u32;

            for step in 0..200 {
                let do_read = in_flight.is_empty() || rng() % 2 == 0;
                if do_read {
                    let pid = (rng() % 4) as u32;
                    let o = (rng() % 1000) as i64;
                    let bbox = BBox::new(o, o, o, o + 10, o + 10, o + 1);
                    let d = c
                        .handle_read(format!("c{pid}").as_bytes(), read_for(pid, bbox))
                        .expect("workers registered");
                    dispatched += 1;
                    let req = d.message.read.unwrap();
                    in_flight.push((d.worker, ReadResult::ok(&req.req_id, b"c")));
                } else {
                    let pick = (rng() as usize) % in_flight.len();
                    let (w, res) = in_flight.swap_remove(pick);
                    c.handle_result(&w, &res);
                    acked += 1;
                }

                let total: u32 = ids.iter().map(|id| c.worker(id).unwrap().load()).sum();
                assert_eq!(total, dispatched - acked, "step {step}");
            }

            // Drain: outstanding returns to zero once all results arrive.
            for (w, res) in in_flight.drain(..) {
                c.handle_result(&w, &res);
            }
            let total: u32 = ids.iter().map(|id| c.worker(id).unwrap().load()).sum();
            assert_eq!(total, 0);
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut c = core(Strategy::Spatial);
        c.handle_ready(b"w0", 1);
        for i in 0..20 {
            let b = BBox::new(i, 0, 0, i + 1, 1, 1);
            c.handle_read(b"cl", read_for(1, b));
        }
        assert_eq!(c.worker(b"w0").unwrap().history().count(), 5);
    }

    #[test]
    fn purge_removes_worker_and_pins() {
        let mut c = core(Strategy::Affinity);
        c.handle_ready(b"w0", 1);
        c.handle_ready(b"w1", 1);
        let pinned = c.handle_read(b"cl", read_for(3, BOX_A)).unwrap().worker;
        c.purge_worker(&pinned);
        assert_eq!(c.worker_count(), 1);
        // The next request routes to the survivor.
        let next = c.handle_read(b"cl", read_for(3, BOX_A)).unwrap().worker;
        assert_ne!(next, pinned);
    }
}
