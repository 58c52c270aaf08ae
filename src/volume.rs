// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The volume seam: the broker is a routing and buffer-plumbing layer, and
// the actual store sits behind the `Volume` trait. Its single obligation is
// the renderbuffer contract — given a destination buffer and a region, write
// the covered voxels into the buffer and leave gaps untouched.

use std::collections::HashMap;

use crate::array::AlignedBuf;
use crate::dtype::{DType, Order};
use crate::error::BrokerError;
use crate::fill;
use crate::geom::BBox;

/// Store metadata the broker needs to size and fill result buffers.
#[derive(Debug, Clone)]
pub struct VolumeMeta {
    pub data_type: DType,
    pub num_channels: u32,
    /// Value reported for voxels outside any stored chunk.
    pub background_color: u64,
}

/// A chunked volumetric store.
pub trait Volume {
    fn meta(&self) -> &VolumeMeta;

    /// Write the voxels of `bbox` into `buf` in the given layout.
    ///
    /// `buf` must be exactly `volume(bbox) * channels * dtype_size` bytes.
    /// Only covered voxels are written — the caller pre-fills the buffer
    /// with the background value.
    fn read_into(&self, bbox: &BBox, order: Order, buf: &mut [u8]) -> Result<(), BrokerError>;

    /// Allocating read: background-fill a fresh buffer, then delegate to
    /// [`read_into`](Volume::read_into). This is the small-request bypass.
    fn read(&self, bbox: &BBox, order: Order) -> Result<AlignedBuf, BrokerError> {
        let meta = self.meta();
        let nbytes =
            bbox.volume() as usize * meta.num_channels as usize * meta.data_type.size_of();
        let mut buf = AlignedBuf::zeroed(nbytes);
        fill::fill_background(buf.as_mut_slice(), meta.data_type, meta.background_color, 1);
        self.read_into(bbox, order, buf.as_mut_slice())?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// ChunkedVolume — in-memory chunked store
// ---------------------------------------------------------------------------

/// In-memory chunked volume. Chunks are fixed-size F-order blocks keyed by
/// chunk coordinate; absent chunks read as background when `fill_missing`
/// is set and are an error otherwise — the same surface a compressed
/// on-disk store presents.
pub struct ChunkedVolume {
    meta: VolumeMeta,
    chunk_dim: [i64; 3],
    chunks: HashMap<[i64; 3], Vec<u8>>,
    fill_missing: bool,
}

impl ChunkedVolume {
    pub fn new(meta: VolumeMeta, chunk_dim: [i64; 3], fill_missing: bool) -> Self {
        assert!(chunk_dim.iter().all(|&d| d > 0), "chunk dims must be positive");
        Self {
            meta,
            chunk_dim,
            chunks: HashMap::new(),
            fill_missing,
        }
    }

    pub fn chunk_dim(&self) -> [i64; 3] {
        self.chunk_dim
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_bytes(&self) -> usize {
        let [cx, cy, cz] = self.chunk_dim;
        (cx * cy * cz) as usize * self.meta.num_channels as usize * self.meta.data_type.size_of()
    }

    /// F-order element index within a chunk.
    fn chunk_index(&self, local: [i64; 3], channel: u32) -> usize {
        let [cx, cy, _] = self.chunk_dim;
        let [lx, ly, lz] = local;
        (lx + cx * (ly + cy * (lz + self.chunk_dim[2] * channel as i64))) as usize
    }

    /// Store one voxel value (low bytes of `value`, element width). Creates
    /// the containing chunk background-filled on first touch.
    pub fn set_voxel(&mut self, pos: [i64; 3], channel: u32, value: u64) {
        assert!(channel < self.meta.num_channels);
        let key = [
            pos[0].div_euclid(self.chunk_dim[0]),
            pos[1].div_euclid(self.chunk_dim[1]),
            pos[2].div_euclid(self.chunk_dim[2]),
        ];
        let local = [
            pos[0].rem_euclid(self.chunk_dim[0]),
            pos[1].rem_euclid(self.chunk_dim[1]),
            pos[2].rem_euclid(self.chunk_dim[2]),
        ];
        let elem = self.meta.data_type.size_of();
        let bg = self.meta.background_color;
        let dtype = self.meta.data_type;
        let nbytes = self.chunk_bytes();
        let idx = self.chunk_index(local, channel);
        let chunk = self.chunks.entry(key).or_insert_with(|| {
            let mut c = vec![0u8; nbytes];
            fill::fill_background(&mut c, dtype, bg, 1);
            c
        });
        let pattern = value.to_le_bytes();
        chunk[idx * elem..idx * elem + elem].copy_from_slice(&pattern[..elem]);
    }
}

impl Volume for ChunkedVolume {
    fn meta(&self) -> &VolumeMeta {
        &self.meta
    }

    fn read_into(&self, bbox: &BBox, order: Order, buf: &mut [u8]) -> Result<(), BrokerError> {
        if bbox.is_empty() {
            return Err(BrokerError::Volume(format!("empty region {bbox}")));
        }
        let elem = self.meta.data_type.size_of();
        let channels = self.meta.num_channels as i64;
        let [dx, dy, dz] = bbox.shape();
        let expected = (dx * dy * dz * channels) as usize * elem;
        if buf.len() != expected {
            return Err(BrokerError::Volume(format!(
                "destination is {} bytes, region needs {expected}",
                buf.len()
            )));
        }

        let [cx, cy, cz] = self.chunk_dim;
        let kx_range = bbox.x1.div_euclid(cx)..=(bbox.x2 - 1).div_euclid(cx);
        let ky_range = bbox.y1.div_euclid(cy)..=(bbox.y2 - 1).div_euclid(cy);
        let kz_range = bbox.z1.div_euclid(cz)..=(bbox.z2 - 1).div_euclid(cz);

        for kz in kz_range {
            for ky in ky_range.clone() {
                for kx in kx_range.clone() {
                    let chunk = match self.chunks.get(&[kx, ky, kz]) {
                        Some(c) => c,
                        None if self.fill_missing => continue,
                        None => {
                            return Err(BrokerError::Volume(format!(
                                "missing chunk ({kx}, {ky}, {kz})"
                            )))
                        }
                    };

                    // World-space intersection of this chunk with the request.
                    let wx1 = bbox.x1.max(kx * cx);
                    let wx2 = bbox.x2.min((kx + 1) * cx);
                    let wy1 = bbox.y1.max(ky * cy);
                    let wy2 = bbox.y2.min((ky + 1) * cy);
                    let wz1 = bbox.z1.max(kz * cz);
                    let wz2 = bbox.z2.min((kz + 1) * cz);

                    for c in 0..channels {
                        for z in wz1..wz2 {
                            for y in wy1..wy2 {
                                let lx = wx1 - kx * cx;
                                let ly = y - ky * cy;
                                let lz = z - kz * cz;
                                let src_idx =
                                    self.chunk_index([lx, ly, lz], c as u32) * elem;
                                let run = (wx2 - wx1) as usize;

                                match order {
                                    Order::F => {
                                        // x is contiguous in both source and
                                        // destination: one copy per row.
                                        let dst_idx = ((wx1 - bbox.x1)
                                            + dx * ((y - bbox.y1)
                                                + dy * ((z - bbox.z1) + dz * c)))
                                            as usize
                                            * elem;
                                        buf[dst_idx..dst_idx + run * elem].copy_from_slice(
                                            &chunk[src_idx..src_idx + run * elem],
                                        );
                                    }
                                    Order::C => {
                                        for i in 0..run as i64 {
                                            let x = wx1 + i;
                                            let dst_idx = ((((x - bbox.x1) * dy
                                                + (y - bbox.y1))
                                                * dz
                                                + (z - bbox.z1))
                                                * channels
                                                + c)
                                                as usize
                                                * elem;
                                            let s = src_idx + i as usize * elem;
                                            buf[dst_idx..dst_idx + elem]
                                                .copy_from_slice(&chunk[s..s + elem]);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u8_volume(fill_missing: bool) -> ChunkedVolume {
        ChunkedVolume::new(
            VolumeMeta {
                data_type: DType::U8,
                num_channels: 1,
                background_color: 7,
            },
            [8, 8, 8],
            fill_missing,
        )
    }

    #[test]
    fn missing_region_reads_background() {
        let vol = u8_volume(true);
        let bbox = BBox::new(0, 0, 0, 10, 10, 1);
        let buf = vol.read(&bbox, Order::F).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 7));
    }

    #[test]
    fn missing_chunk_errors_without_fill() {
        let vol = u8_volume(false);
        let bbox = BBox::new(0, 0, 0, 4, 4, 1);
        assert!(matches!(
            vol.read(&bbox, Order::F),
            Err(BrokerError::Volume(_))
        ));
    }

    #[test]
    fn stored_voxels_come_back() {
        let mut vol = u8_volume(true);
        vol.set_voxel([3, 4, 0], 0, 42);
        let bbox = BBox::new(0, 0, 0, 8, 8, 1);
        let buf = vol.read(&bbox, Order::F).unwrap();
        // F order: index = x + dx*y
        assert_eq!(buf.as_slice()[3 + 8 * 4], 42);
        assert_eq!(buf.as_slice()[0], 7);
    }

    #[test]
    fn read_spans_chunk_boundaries() {
        let mut vol = u8_volume(true);
        vol.set_voxel([7, 0, 0], 0, 1); // last voxel of chunk (0,0,0)
        vol.set_voxel([8, 0, 0], 0, 2); // first voxel of chunk (1,0,0)
        let bbox = BBox::new(6, 0, 0, 10, 1, 1);
        let buf = vol.read(&bbox, Order::F).unwrap();
        assert_eq!(buf.as_slice(), &[7, 1, 2, 7]);
    }

    #[test]
    fn negative_coordinates_resolve() {
        let mut vol = u8_volume(true);
        vol.set_voxel([-1, -1, -1], 0, 9);
        let bbox = BBox::new(-2, -2, -2, 0, 0, 0);
        let buf = vol.read(&bbox, Order::F).unwrap();
        // (-1,-1,-1) is the last element of the 2x2x2 block in F order.
        assert_eq!(buf.as_slice()[7], 9);
    }

    #[test]
    fn c_order_matches_f_order_logically() {
        let mut vol = ChunkedVolume::new(
            VolumeMeta {
                data_type: DType::U16,
                num_channels: 2,
                background_color: 0,
            },
            [4, 4, 4],
            true,
        );
        vol.set_voxel([1, 2, 3], 1, 0x0102);
        let bbox = BBox::new(0, 0, 0, 4, 4, 4);

        let f = vol.read(&bbox, Order::F).unwrap();
        let c = vol.read(&bbox, Order::C).unwrap();

        // F: elem = x + 4*(y + 4*(z + 4*ch))
        let f_idx = (1 + 4 * (2 + 4 * (3 + 4 * 1))) * 2;
        assert_eq!(&f.as_slice()[f_idx..f_idx + 2], &[0x02, 0x01]);
        // C: elem = ((x*4 + y)*4 + z)*2 + ch
        let c_idx = (((1 * 4 + 2) * 4 + 3) * 2 + 1) * 2;
        assert_eq!(&c.as_slice()[c_idx..c_idx + 2], &[0x02, 0x01]);
    }

    #[test]
    fn wrong_buffer_size_rejected() {
        let vol = u8_volume(true);
        let bbox = BBox::new(0, 0, 0, 4, 4, 1);
        let mut buf = vec![0u8; 15];
        assert!(vol.read_into(&bbox, Order::F, &mut buf).is_err());
    }
}
