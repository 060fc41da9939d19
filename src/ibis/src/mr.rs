//! Protection domains and registered memory regions.
//!
//! A [`ProtectionDomain`] is a shared guard around the provider-side domain:
//! the endpoint that allocated it and every region registered under it hold
//! a reference, so the domain is deallocated only after the last of them is
//! gone. A region therefore cannot observe a freed domain.

use std::sync::Arc;

use crate::cm::{self, CmOps};
use crate::verbs::AccessFlags;
use crate::Result;

pub struct ProtectionDomain<T: CmOps> {
    ops: Arc<T>,
    raw: cm::ProtectionDomain,
}

impl<T: CmOps> ProtectionDomain<T> {
    pub(crate) fn new(ops: Arc<T>, raw: cm::ProtectionDomain) -> Self {
        ProtectionDomain { ops, raw }
    }

    #[inline]
    pub fn raw(&self) -> cm::ProtectionDomain {
        self.raw
    }
}

impl<T: CmOps> Drop for ProtectionDomain<T> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.dealloc_pd(self.raw) {
            log::warn!("deallocating protection domain: {}", e);
        }
    }
}

/// A buffer registered with a protection domain.
///
/// Registration is never deduplicated: registering the same buffer twice
/// yields two independent regions, each carrying its own provider handle.
/// The region deregisters itself on drop.
pub struct MemoryRegion<T: CmOps> {
    ops: Arc<T>,
    pd: Arc<ProtectionDomain<T>>,
    raw: cm::MemoryRegion,
    addr: usize,
    len: usize,
    access: AccessFlags,
}

impl<T: CmOps> MemoryRegion<T> {
    pub(crate) fn register(
        ops: Arc<T>,
        pd: Arc<ProtectionDomain<T>>,
        addr: *const u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Self> {
        let raw = ops.reg_mr(pd.raw(), addr, len, access)?;
        Ok(MemoryRegion {
            ops,
            pd,
            raw,
            addr: addr as usize,
            len,
            access,
        })
    }

    #[inline]
    pub fn raw(&self) -> cm::MemoryRegion {
        self.raw
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    #[inline]
    pub fn pd(&self) -> &ProtectionDomain<T> {
        &self.pd
    }
}

impl<T: CmOps> Drop for MemoryRegion<T> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.dereg_mr(self.raw) {
            log::warn!("deregistering memory region: {}", e);
        }
    }
}
