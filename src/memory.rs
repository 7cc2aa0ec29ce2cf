use crate::error::{AccessFault, AccessKind, MapError};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::ops::Range;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u32 {
        const NONE = 0;
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Handle returned by [`Memory::map`]. Only the mapping that produced it can
/// be unmapped or reprotected through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    base: u64,
    id: u64,
}

impl RegionHandle {
    pub fn base(&self) -> u64 {
        self.base
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub perms: Permission,
    pub data: Vec<u8>,
    id: u64,
}

impl MemoryRegion {
    fn new(start: u64, size: usize, perms: Permission, id: u64) -> Self {
        Self {
            start,
            end: start + size as u64,
            perms,
            data: vec![0; size],
            id,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn handle(&self) -> RegionHandle {
        RegionHandle {
            base: self.start,
            id: self.id,
        }
    }

    /// Offset of `addr..addr + len` inside this region, if it fits entirely.
    fn span(&self, addr: u64, len: usize) -> Option<usize> {
        let end = addr.checked_add(len as u64)?;
        (self.contains(addr) && end <= self.end).then(|| (addr - self.start) as usize)
    }
}

/// Guest address space made of non-overlapping, byte-granular regions.
///
/// Every access must fall inside one region; an access straddling two
/// adjacent regions faults like an unmapped one.
#[derive(Debug)]
pub struct Memory {
    regions: BTreeMap<u64, MemoryRegion>,
    next_id: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn map(
        &mut self,
        addr: u64,
        size: usize,
        perms: Permission,
    ) -> Result<RegionHandle, MapError> {
        let end = match addr.checked_add(size as u64) {
            Some(end) if size > 0 => end,
            _ => return Err(MapError::InvalidSize { address: addr, size }),
        };

        if let Some(region) = self
            .regions
            .values()
            .find(|region| addr < region.end && region.start < end)
        {
            return Err(MapError::Overlap {
                start: region.start.max(addr),
                end: region.end.min(end),
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        let region = MemoryRegion::new(addr, size, perms, id);
        let handle = region.handle();
        self.regions.insert(addr, region);
        Ok(handle)
    }

    pub fn unmap(&mut self, handle: RegionHandle) -> Result<(), MapError> {
        self.live_region(handle)?;
        self.regions.remove(&handle.base);
        Ok(())
    }

    pub fn protect(&mut self, handle: RegionHandle, perms: Permission) -> Result<(), MapError> {
        self.live_region(handle)?;
        if let Some(region) = self.regions.get_mut(&handle.base) {
            region.perms = perms;
        }
        Ok(())
    }

    fn live_region(&self, handle: RegionHandle) -> Result<&MemoryRegion, MapError> {
        self.regions
            .get(&handle.base)
            .filter(|region| region.id == handle.id)
            .ok_or(MapError::UnknownRegion(handle.base))
    }

    pub fn find_region(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    fn find_region_mut(&mut self, addr: u64) -> Option<&mut MemoryRegion> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Resolve a whole access to one region and check `required` permissions.
    fn resolve(
        &self,
        addr: u64,
        len: usize,
        required: Permission,
        kind: AccessKind,
    ) -> Result<(&MemoryRegion, usize), AccessFault> {
        let unmapped = AccessFault::Unmapped {
            address: addr,
            size: len,
            kind,
        };
        let region = self.find_region(addr).ok_or(unmapped.clone())?;
        let offset = region.span(addr, len).ok_or(unmapped)?;

        if !region.perms.contains(required) {
            return Err(AccessFault::ProtectionViolation {
                address: addr,
                size: len,
                kind,
            });
        }

        Ok((region, offset))
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessFault> {
        let (region, offset) = self.resolve(addr, buf.len(), Permission::READ, AccessKind::Read)?;
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), AccessFault> {
        self.write_checked(addr, data, Permission::WRITE)
    }

    /// Write `data` like [`Memory::write`], copying the bytes it replaces
    /// into `previous` (which must be the same length).
    pub fn exchange(
        &mut self,
        addr: u64,
        data: &[u8],
        previous: &mut [u8],
    ) -> Result<(), AccessFault> {
        let (_, offset) = self.resolve(addr, data.len(), Permission::WRITE, AccessKind::Write)?;
        let region = self
            .find_region_mut(addr)
            .ok_or(AccessFault::Unmapped {
                address: addr,
                size: data.len(),
                kind: AccessKind::Write,
            })?;
        let span = &mut region.data[offset..offset + data.len()];
        previous.copy_from_slice(span);
        span.copy_from_slice(data);
        Ok(())
    }

    /// Write without the WRITE permission check, for placing code into
    /// read/execute-only regions. The range must still be mapped.
    pub fn load(&mut self, addr: u64, data: &[u8]) -> Result<(), AccessFault> {
        self.write_checked(addr, data, Permission::NONE)
    }

    fn write_checked(
        &mut self,
        addr: u64,
        data: &[u8],
        required: Permission,
    ) -> Result<(), AccessFault> {
        let (_, offset) = self.resolve(addr, data.len(), required, AccessKind::Write)?;
        let region = self
            .find_region_mut(addr)
            .ok_or(AccessFault::Unmapped {
                address: addr,
                size: data.len(),
                kind: AccessKind::Write,
            })?;
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Bytes available for instruction fetch at `addr`: at most `max_len`,
    /// never past the end of the executable region holding `addr`.
    pub fn fetch(&self, addr: u64, max_len: usize) -> Result<&[u8], AccessFault> {
        let region = self.find_region(addr).ok_or(AccessFault::Unmapped {
            address: addr,
            size: 1,
            kind: AccessKind::Fetch,
        })?;

        if !region.perms.contains(Permission::EXEC) {
            return Err(AccessFault::ProtectionViolation {
                address: addr,
                size: 1,
                kind: AccessKind::Fetch,
            });
        }

        let offset = (addr - region.start) as usize;
        let len = max_len.min(region.size() - offset);
        Ok(&region.data[offset..offset + len])
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, AccessFault> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), AccessFault> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    pub fn total_size(&self) -> usize {
        self.regions.values().map(|r| r.size()).sum()
    }
}
