// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// voxbroker — a spatially-aware request broker for chunk-compressed 3D
// volumetric stores. Clients request axis-aligned sub-volumes; a scheduler
// routes each request to the worker most likely to have the source chunks
// warm; the worker materialises the voxels directly into a named POSIX
// shared-memory buffer; the client gets a zero-copy array whose release
// unlinks the buffer.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

pub mod dtype;
pub use dtype::{DType, Order};

pub mod geom;
pub use geom::{intersection_volume, morton3, morton_cell, BBox};

pub mod error;
pub use error::BrokerError;

pub mod fill;

pub mod wire;

pub mod transport;
pub use transport::{DealerSocket, RouterSocket};

pub mod array;
pub use array::{AlignedBuf, ArrayView, Element, VolumeArray};

pub mod volume;
pub use volume::{ChunkedVolume, Volume, VolumeMeta};

pub mod scheduler;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerCore, Strategy};

pub mod worker;
pub use worker::{VolumeWorker, WorkerConfig};

pub mod client;
pub use client::{ClientConfig, ClientProxy, DEFAULT_SHM_THRESHOLD};

pub mod supervisor;
pub use supervisor::{Cluster, ProcessHandle, WorkerPlan};
