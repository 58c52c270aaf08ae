// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broker cluster entry point.
//
// Usage:
//   voxbroker scheduler <socket> [round-robin|affinity|spatial]
//   voxbroker worker <socket> <index> <parallel>
//   voxbroker cluster <socket> <parallel>x<count>[,<parallel>x<count>...]
//   voxbroker read <socket> <x1:x2> <y1:y2> <z1:z2> [count]
//
// `cluster` re-executes this binary for the scheduler and each worker and
// supervises them until SIGINT/SIGTERM. `read` is a demo client issuing
// timed reads against the built-in demo volume.

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use voxbroker::{
    ChunkedVolume, ClientConfig, ClientProxy, Cluster, DType, Scheduler, SchedulerConfig,
    Strategy, VolumeMeta, VolumeWorker, WorkerConfig, WorkerPlan,
};

fn usage() -> ! {
    eprintln!("usage: voxbroker scheduler <socket> [round-robin|affinity|spatial]");
    eprintln!("       voxbroker worker <socket> <index> <parallel>");
    eprintln!("       voxbroker cluster <socket> <parallel>x<count>[,...]");
    eprintln!("       voxbroker read <socket> <x1:x2> <y1:y2> <z1:z2> [count]");
    std::process::exit(1);
}

/// Deterministic in-memory volume shared by the demo worker and client:
/// a 64-voxel cube at the origin where each voxel holds `(x + y + z) & 0xff`,
/// background 0 elsewhere.
fn demo_volume() -> ChunkedVolume {
    let meta = VolumeMeta {
        data_type: DType::U8,
        num_channels: 1,
        background_color: 0,
    };
    let mut vol = ChunkedVolume::new(meta, [32, 32, 32], true);
    for z in 0..64 {
        for y in 0..64 {
            for x in 0..64 {
                vol.set_voxel([x, y, z], 0, ((x + y + z) & 0xff) as u64);
            }
        }
    }
    vol
}

fn run_scheduler(socket: &str, strategy: Option<&str>) {
    let mut cfg = SchedulerConfig::default();
    if let Some(tag) = strategy {
        cfg.strategy = match Strategy::parse(tag) {
            Some(s) => s,
            None => {
                eprintln!("unknown strategy: {tag}");
                std::process::exit(1);
            }
        };
    }
    let mut sched = Scheduler::bind(socket, cfg).expect("bind scheduler socket");
    if let Err(e) = sched.run() {
        eprintln!("scheduler failed: {e}");
        std::process::exit(1);
    }
}

fn run_worker(socket: &str, index: usize, parallel: u32) {
    let mut cfg = WorkerConfig::new(socket, index);
    cfg.parallel = parallel;
    let mut worker = VolumeWorker::connect(cfg, demo_volume()).expect("connect worker");
    if let Err(e) = worker.run() {
        eprintln!("worker {index} failed: {e}");
        std::process::exit(1);
    }
}

/// Parse a worker plan like `4x2,8x1` into [(parallel=4, count=2), ...].
fn parse_plan(s: &str) -> Option<Vec<WorkerPlan>> {
    let mut plan = Vec::new();
    for part in s.split(',') {
        let (par, count) = part.split_once('x')?;
        plan.push(WorkerPlan {
            parallel: par.parse().ok()?,
            count: count.parse().ok()?,
        });
    }
    if plan.is_empty() {
        None
    } else {
        Some(plan)
    }
}

fn run_cluster(socket: &str, plan: &str) {
    let plan = match parse_plan(plan) {
        Some(p) => p,
        None => {
            eprintln!("bad worker plan (expected <parallel>x<count>[,...]): {plan}");
            std::process::exit(1);
        }
    };
    let exe = std::env::current_exe().expect("current_exe");
    let mut cluster = Cluster::start(&exe.to_string_lossy(), Path::new(socket), &plan)
        .expect("start cluster");

    install_shutdown_flag();

    while !SHUTDOWN.load(Ordering::Acquire) {
        let dead = cluster.check();
        if dead == cluster.procs().len() {
            eprintln!("all children dead, exiting");
            break;
        }
        // Sleep in short slices so a termination signal is honoured
        // promptly rather than after a full check interval.
        for _ in 0..50 {
            if SHUTDOWN.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    cluster.stop(Duration::from_secs(5));
}

fn parse_range(s: &str) -> Option<Range<i64>> {
    let (a, b) = s.split_once(':')?;
    Some(a.parse().ok()?..b.parse().ok()?)
}

fn run_read(socket: &str, ranges: [Range<i64>; 3], count: usize) {
    let mut cfg = ClientConfig::new(socket);
    cfg.shm_threshold = 0; // the demo always exercises the broker path
    let mut client = ClientProxy::connect(cfg, demo_volume()).expect("connect client");

    for i in 0..count {
        let start = Instant::now();
        match client.read(ranges.clone()) {
            Ok(arr) => {
                println!(
                    "read {i}: shape {:?} in {:.1} ms, [0,0,0,0] = {}",
                    arr.shape(),
                    start.elapsed().as_secs_f64() * 1e3,
                    arr.get::<u8>([0, 0, 0, 0]),
                );
            }
            Err(e) => {
                eprintln!("read {i} failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage();
    }

    match args[1].as_str() {
        "scheduler" => run_scheduler(&args[2], args.get(3).map(String::as_str)),
        "worker" => {
            if args.len() < 5 {
                usage();
            }
            let index: usize = args[3].parse().unwrap_or_else(|_| usage());
            let parallel: u32 = args[4].parse().unwrap_or_else(|_| usage());
            run_worker(&args[2], index, parallel);
        }
        "cluster" => {
            if args.len() < 4 {
                usage();
            }
            run_cluster(&args[2], &args[3]);
        }
        "read" => {
            if args.len() < 6 {
                usage();
            }
            let rx = parse_range(&args[3]).unwrap_or_else(|| usage());
            let ry = parse_range(&args[4]).unwrap_or_else(|| usage());
            let rz = parse_range(&args[5]).unwrap_or_else(|| usage());
            let count = args
                .get(6)
                .map(|c| c.parse().unwrap_or_else(|_| usage()))
                .unwrap_or(1);
            run_read(&args[2], [rx, ry, rz], count);
        }
        other => {
            eprintln!("unknown subcommand: {other}");
            usage();
        }
    }
}

/// Set by the signal handler; polled by the supervision loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Route SIGINT and SIGTERM to the shutdown flag. The handler body is a
/// single atomic store, so it is async-signal-safe.
fn install_shutdown_flag() {
    extern "C" fn on_signal(_: libc::c_int) {
        SHUTDOWN.store(true, Ordering::Release);
    }
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}
