// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scoped-ownership result array.
//
// `VolumeArray` is the handle returned to the user: a 4-D `(x, y, z, c)`
// view over either a shared-memory mapping (broker path) or an aligned heap
// buffer (small-request bypass). Exactly one owner exists per buffer — the
// array is not `Clone`, and for shm backings its release is the one place
// the segment is unlinked. Derivative views borrow and can never unlink.

use crate::dtype::{DType, Order};
use crate::error::BrokerError;
use crate::shm::ShmHandle;

// ---------------------------------------------------------------------------
// AlignedBuf — 8-byte-aligned heap storage
// ---------------------------------------------------------------------------

/// Heap buffer with 8-byte base alignment, so typed access works for every
/// supported element width. Backs bypass-path reads.
pub struct AlignedBuf {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u64; (len + 7) / 8].into_boxed_slice();
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

// ---------------------------------------------------------------------------
// Element — types that can live in a volume
// ---------------------------------------------------------------------------

/// Marker for primitive element types, tying the Rust type to its wire tag.
pub trait Element: Copy {
    const DTYPE: DType;
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;
}
impl Element for u16 {
    const DTYPE: DType = DType::U16;
}
impl Element for u32 {
    const DTYPE: DType = DType::U32;
}
impl Element for u64 {
    const DTYPE: DType = DType::U64;
}
impl Element for f32 {
    const DTYPE: DType = DType::F32;
}
impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

// ---------------------------------------------------------------------------
// VolumeArray
// ---------------------------------------------------------------------------

enum Backing {
    /// Shared-memory mapping; unlinked exactly once, on release.
    Shm(ShmHandle),
    /// Plain heap storage from the bypass path; release is a free.
    Heap(AlignedBuf),
}

/// An owned n-dimensional array over a result buffer.
pub struct VolumeArray {
    backing: Option<Backing>,
    shape: [usize; 4],
    dtype: DType,
    order: Order,
}

fn checked_nbytes(shape: &[usize; 4], dtype: DType) -> usize {
    shape.iter().product::<usize>() * dtype.size_of()
}

/// Element strides for a dense `(x, y, z, c)` array in the given layout.
fn dense_strides(shape: &[usize; 4], order: Order) -> [usize; 4] {
    let [sx, sy, sz, sc] = *shape;
    match order {
        Order::F => [1, sx, sx * sy, sx * sy * sz],
        Order::C => [sy * sz * sc, sz * sc, sc, 1],
    }
}

impl VolumeArray {
    /// Wrap an attached shared buffer. Fails when the mapping size does not
    /// match the shape.
    pub(crate) fn from_shm(
        shm: ShmHandle,
        shape: [usize; 4],
        dtype: DType,
        order: Order,
    ) -> Result<Self, BrokerError> {
        let nbytes = checked_nbytes(&shape, dtype);
        if shm.size() != nbytes {
            // The mis-sized segment must not outlive the failed wrap.
            shm.unlink();
            return Err(BrokerError::Protocol(format!(
                "shared buffer is {} bytes, shape needs {nbytes}",
                shm.size()
            )));
        }
        Ok(Self {
            backing: Some(Backing::Shm(shm)),
            shape,
            dtype,
            order,
        })
    }

    /// Wrap a heap buffer from the bypass path.
    pub fn from_heap(
        buf: AlignedBuf,
        shape: [usize; 4],
        dtype: DType,
        order: Order,
    ) -> Result<Self, BrokerError> {
        let nbytes = checked_nbytes(&shape, dtype);
        if buf.len() != nbytes {
            return Err(BrokerError::Protocol(format!(
                "buffer is {} bytes, shape needs {nbytes}",
                buf.len()
            )));
        }
        Ok(Self {
            backing: Some(Backing::Heap(buf)),
            shape,
            dtype,
            order,
        })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        checked_nbytes(&self.shape, self.dtype)
    }

    /// Whether this array is backed by a shared-memory segment.
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Some(Backing::Shm(_)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.backing.as_ref().expect("released array") {
            Backing::Shm(shm) => shm.as_slice(),
            Backing::Heap(buf) => buf.as_slice(),
        }
    }

    /// Typed flat view of the whole buffer, in storage order.
    ///
    /// # Panics
    /// Panics when `T` does not match the array's dtype.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        assert_eq!(
            T::DTYPE,
            self.dtype,
            "element type {} requested on a {} array",
            T::DTYPE,
            self.dtype
        );
        let bytes = self.as_bytes();
        let (prefix, elems, suffix) = unsafe { bytes.align_to::<T>() };
        assert!(prefix.is_empty() && suffix.is_empty(), "unaligned buffer");
        elems
    }

    /// Read one element at `(x, y, z, c)`.
    ///
    /// # Panics
    /// Panics on dtype mismatch or out-of-bounds index.
    pub fn get<T: Element>(&self, idx: [usize; 4]) -> T {
        self.view().get(idx)
    }

    /// A borrowed, non-owning view over the whole array. Views can be
    /// sliced further; none of them can release the buffer.
    pub fn view(&self) -> ArrayView<'_> {
        ArrayView {
            bytes: self.as_bytes(),
            shape: self.shape,
            strides: dense_strides(&self.shape, self.order),
            offset: 0,
            dtype: self.dtype,
        }
    }

    /// Release the buffer: for a shared backing this closes the mapping and
    /// unlinks the segment; dropping the array does the same. Explicit
    /// release exists so callers can make the unlink point visible.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(Backing::Shm(shm)) = self.backing.take() {
            shm.unlink();
        }
    }
}

impl Drop for VolumeArray {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for VolumeArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("order", &self.order)
            .field("shared", &self.is_shared())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ArrayView
// ---------------------------------------------------------------------------

/// A borrowed view into a [`VolumeArray`] (or a slice of one).
#[derive(Clone, Copy)]
pub struct ArrayView<'a> {
    bytes: &'a [u8],
    shape: [usize; 4],
    strides: [usize; 4], // in elements
    offset: usize,       // in elements
    dtype: DType,
}

impl<'a> ArrayView<'a> {
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Read one element at `(x, y, z, c)` relative to this view.
    ///
    /// # Panics
    /// Panics on dtype mismatch or out-of-bounds index.
    pub fn get<T: Element>(&self, idx: [usize; 4]) -> T {
        assert_eq!(
            T::DTYPE,
            self.dtype,
            "element type {} requested on a {} view",
            T::DTYPE,
            self.dtype
        );
        for d in 0..4 {
            assert!(
                idx[d] < self.shape[d],
                "index {idx:?} out of bounds for shape {:?}",
                self.shape
            );
        }
        let elem = self.offset
            + idx[0] * self.strides[0]
            + idx[1] * self.strides[1]
            + idx[2] * self.strides[2]
            + idx[3] * self.strides[3];
        let sz = std::mem::size_of::<T>();
        let off = elem * sz;
        assert!(off + sz <= self.bytes.len());
        unsafe { std::ptr::read_unaligned(self.bytes.as_ptr().add(off) as *const T) }
    }

    /// A sub-view starting at `start` with extent `shape`, both in
    /// `(x, y, z, c)`. The result borrows the same buffer.
    ///
    /// # Panics
    /// Panics when the requested window exceeds this view.
    pub fn slice(&self, start: [usize; 4], shape: [usize; 4]) -> ArrayView<'a> {
        for d in 0..4 {
            assert!(
                start[d] + shape[d] <= self.shape[d],
                "slice {start:?}+{shape:?} out of bounds for {:?}",
                self.shape
            );
        }
        let offset = self.offset
            + start[0] * self.strides[0]
            + start[1] * self.strides[1]
            + start[2] * self.strides[2]
            + start[3] * self.strides[3];
        ArrayView {
            bytes: self.bytes,
            shape,
            strides: self.strides,
            offset,
            dtype: self.dtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{ShmHandle, ShmOpenMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_name(prefix: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{}_{n}", std::process::id())
    }

    fn heap_array(order: Order) -> VolumeArray {
        // 2x2x1x1 u8 array with elements 0..4 in logical (x, y) order.
        let mut buf = AlignedBuf::zeroed(4);
        let vals: &[u8] = match order {
            Order::F => &[0, 1, 2, 3],  // x fastest
            Order::C => &[0, 2, 1, 3],  // c/z/y fastest
        };
        buf.as_mut_slice().copy_from_slice(vals);
        VolumeArray::from_heap(buf, [2, 2, 1, 1], DType::U8, order).unwrap()
    }

    #[test]
    fn indexing_respects_order() {
        for order in [Order::F, Order::C] {
            let arr = heap_array(order);
            assert_eq!(arr.get::<u8>([0, 0, 0, 0]), 0);
            assert_eq!(arr.get::<u8>([1, 0, 0, 0]), 1);
            assert_eq!(arr.get::<u8>([0, 1, 0, 0]), 2);
            assert_eq!(arr.get::<u8>([1, 1, 0, 0]), 3);
        }
    }

    #[test]
    fn view_slice_is_window() {
        let arr = heap_array(Order::F);
        let v = arr.view().slice([1, 0, 0, 0], [1, 2, 1, 1]);
        assert_eq!(v.get::<u8>([0, 0, 0, 0]), 1);
        assert_eq!(v.get::<u8>([0, 1, 0, 0]), 3);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let buf = AlignedBuf::zeroed(3);
        assert!(VolumeArray::from_heap(buf, [2, 2, 1, 1], DType::U8, Order::F).is_err());
    }

    #[test]
    #[should_panic(expected = "element type")]
    fn wrong_dtype_panics() {
        let arr = heap_array(Order::F);
        let _ = arr.get::<u16>([0, 0, 0, 0]);
    }

    #[test]
    fn typed_slice_roundtrip() {
        let mut buf = AlignedBuf::zeroed(16);
        buf.as_mut_slice()[..8].copy_from_slice(&42u64.to_le_bytes());
        let arr = VolumeArray::from_heap(buf, [2, 1, 1, 1], DType::U64, Order::F).unwrap();
        assert_eq!(arr.as_slice::<u64>(), &[42, 0]);
    }

    #[test]
    fn release_unlinks_shared_backing() {
        let name = unique_name("va_release");
        let shm = ShmHandle::acquire(&name, 16, ShmOpenMode::Create).expect("create");
        let arr = VolumeArray::from_shm(shm, [16, 1, 1, 1], DType::U8, Order::F).unwrap();
        // While the owner lives, the name can be attached.
        assert!(ShmHandle::acquire(&name, 16, ShmOpenMode::Open).is_ok());
        arr.release();
        // After release the name is gone.
        assert!(ShmHandle::acquire(&name, 16, ShmOpenMode::Open).is_err());
    }

    #[test]
    fn drop_unlinks_shared_backing() {
        let name = unique_name("va_drop");
        let shm = ShmHandle::acquire(&name, 8, ShmOpenMode::Create).expect("create");
        {
            let _arr = VolumeArray::from_shm(shm, [8, 1, 1, 1], DType::U8, Order::F).unwrap();
        }
        assert!(ShmHandle::acquire(&name, 8, ShmOpenMode::Open).is_err());
    }
}
