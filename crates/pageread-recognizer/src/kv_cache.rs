//! Per-layer growing KV cache. Grows in fixed 256-token blocks via
//! `pad_to_multiple`; `offset` marks the live prefix. One cache belongs
//! to exactly one recognition stream and is never shared across
//! concurrent calls, so the leading batch dimension is omitted
//! throughout — it is always 1.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

const BLOCK: usize = 256;

pub struct KvCache {
    keys: Tensor,
    values: Tensor,
    offset: usize,
}

impl KvCache {
    pub fn new(num_kv_heads: usize, head_dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let keys = Tensor::zeros((num_kv_heads, 0, head_dim), dtype, device)?;
        let values = keys.clone();
        Ok(Self { keys, values, offset: 0 })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Appends `new_k`/`new_v` (`[num_kv_heads, L, head_dim]`) to the
    /// live region, padding the backing storage up to the next 256-token
    /// block, and returns the live `[num_kv_heads, offset+L, head_dim]`
    /// slices.
    pub fn append(&mut self, new_k: &Tensor, new_v: &Tensor) -> Result<(Tensor, Tensor)> {
        let len = new_k.dim(1)?;
        let live_k = self.keys.narrow(1, 0, self.offset)?;
        let live_v = self.values.narrow(1, 0, self.offset)?;
        let combined_k = Tensor::cat(&[&live_k, new_k], 1)?;
        let combined_v = Tensor::cat(&[&live_v, new_v], 1)?;
        self.keys = pageread_tensor::pad_to_multiple(&combined_k, 1, BLOCK)?;
        self.values = pageread_tensor::pad_to_multiple(&combined_v, 1, BLOCK)?;
        self.offset += len;
        Ok((self.keys.narrow(1, 0, self.offset)?, self.values.narrow(1, 0, self.offset)?))
    }
}

/// One [`KvCache`] per decoder layer, owned for the lifetime of one
/// generation call.
pub struct KvCacheStack {
    caches: Vec<KvCache>,
}

impl KvCacheStack {
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let mut caches = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            caches.push(KvCache::new(num_kv_heads, head_dim, device, dtype)?);
        }
        Ok(Self { caches })
    }

    pub fn layer(&mut self, index: usize) -> &mut KvCache {
        &mut self.caches[index]
    }

    pub fn offset(&self) -> usize {
        self.caches.first().map(|c| c.offset()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_pads_to_next_block_and_tracks_offset() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(2, 4, &device, DType::F32).unwrap();
        let k = Tensor::zeros((2, 10, 4), DType::F32, &device).unwrap();
        let v = k.clone();
        let (live_k, _) = cache.append(&k, &v).unwrap();
        assert_eq!(cache.offset(), 10);
        assert_eq!(live_k.dims(), &[2, 10, 4]);
        assert_eq!(cache.keys.dims()[1], BLOCK);
    }

    #[test]
    fn append_twice_accumulates_offset() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(1, 2, &device, DType::F32).unwrap();
        let first = Tensor::zeros((1, 5, 2), DType::F32, &device).unwrap();
        cache.append(&first, &first).unwrap();
        let second = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
        let (live_k, _) = cache.append(&second, &second).unwrap();
        assert_eq!(cache.offset(), 6);
        assert_eq!(live_k.dims(), &[1, 6, 2]);
    }
}
