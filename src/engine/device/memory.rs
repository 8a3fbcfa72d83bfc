//! Zero-copy io buffers shared with the NPU

use super::driver::Context;
use super::ffi::*;
use crate::error::{Error, Result};

/// Driver-allocated buffer bound to one input or output tensor.
/// Must be dropped before the [`Context`] that created it.
pub struct ZeroCopyMem {
    mem: *mut TensorMem,
    pub attr: TensorAttr,
    raw_ctx: RawContext,
    destroy: FnDestroyMem,
}

impl ZeroCopyMem {
    pub fn bind(ctx: &Context, mut attr: TensorAttr) -> Result<Self> {
        let size = attr.size_with_stride.max(attr.size);
        // SAFETY: ctx is a live context
        let mem = unsafe { (ctx.driver.create_mem)(ctx.raw, size) };
        if mem.is_null() {
            return Err(Error::Resource(format!(
                "rknn_create_mem({}) failed for tensor {}",
                size, attr.index
            )));
        }

        // SAFETY: mem was just allocated by this context
        let ret = unsafe { (ctx.driver.set_io_mem)(ctx.raw, mem, &mut attr) };
        if ret != 0 {
            unsafe { (ctx.driver.destroy_mem)(ctx.raw, mem) };
            return Err(Error::Resource(format!(
                "rknn_set_io_mem failed with code {} for tensor {}",
                ret, attr.index
            )));
        }

        Ok(Self {
            mem,
            attr,
            raw_ctx: ctx.raw,
            destroy: ctx.driver.destroy_mem,
        })
    }

    fn capacity(&self) -> usize {
        // SAFETY: mem is non-null for the lifetime of self
        unsafe { (*self.mem).size as usize }
    }

    /// Copy `data` into the buffer, truncated to its capacity.
    pub fn write(&mut self, data: &[u8]) {
        let len = data.len().min(self.capacity());
        // SAFETY: virt_addr points at `capacity` writable bytes
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (*self.mem).virt_addr as *mut u8, len);
        }
    }

    pub fn sync_from_device(&self, ctx: &Context) -> Result<()> {
        // SAFETY: mem belongs to ctx
        let ret = unsafe { (ctx.driver.mem_sync)(ctx.raw, self.mem, MEM_SYNC_FROM_DEVICE) };
        if ret != 0 {
            return Err(Error::Resource(format!("rknn_mem_sync failed with code {}", ret)));
        }
        Ok(())
    }

    /// Borrow the buffer contents; copy out before the next run.
    pub fn bytes(&self) -> &[u8] {
        let len = (self.attr.size_with_stride.max(self.attr.size) as usize).min(self.capacity());
        // SAFETY: virt_addr points at `capacity` readable bytes
        unsafe { std::slice::from_raw_parts((*self.mem).virt_addr as *const u8, len) }
    }
}

impl Drop for ZeroCopyMem {
    fn drop(&mut self) {
        // SAFETY: the owning context is still alive (field order in DeviceModel)
        unsafe {
            (self.destroy)(self.raw_ctx, self.mem);
        }
    }
}
