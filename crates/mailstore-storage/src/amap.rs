//! Allocation map: which 64-byte units of the file are in use.
//!
//! The file past offset 0x4400 is split into regions of 253,952 bytes. Each
//! region starts with a 512-byte allocation map page whose 496 payload bytes
//! hold one bit per 64-byte unit of that region, most significant bit first.
//!
//! Region layout:
//! ```text
//! +-----------------+ region start
//! | AMap page (512) |
//! +-----------------+ +512   (every 8th region)
//! | PMap page (512) |
//! +-----------------+ +1024  (region 128, then every 496th)
//! | FMap page (512) |
//! +-----------------+ +1536  (region 8192, then every 31744th)
//! | FPMap page(512) |
//! +-----------------+
//! | blocks, pages   |
//! +-----------------+ region end
//! ```

use crate::device::ByteDevice;
use mailstore_common::{
    seal_page, verify_page, BlockId, MailstoreError, PageType, Result, PAGE_DATA_SIZE, PAGE_SIZE,
};
use tracing::{debug, trace};

/// File offset of the first allocation map page.
pub const AMAP_FIRST_OFFSET: u64 = 0x4400;

/// Bytes covered by one bit.
pub const BYTES_PER_UNIT: u64 = 64;

/// Units tracked by one map page.
pub const UNITS_PER_REGION: usize = PAGE_DATA_SIZE * 8;

/// Bytes covered by one map page, including the page itself.
pub const REGION_SIZE: u64 = UNITS_PER_REGION as u64 * BYTES_PER_UNIT;

const PMAP_REGION_INTERVAL: u64 = 8;
const FMAP_FIRST_REGION: u64 = 128;
const FMAP_REGION_INTERVAL: u64 = 496;
const FPMAP_FIRST_REGION: u64 = 8192;
const FPMAP_REGION_INTERVAL: u64 = 496 * 8 * PMAP_REGION_INTERVAL;

const UNITS_PER_PAGE: usize = PAGE_SIZE / BYTES_PER_UNIT as usize;

/// Number of units needed to cover `len` bytes.
fn units_for(len: u64) -> usize {
    len.div_ceil(BYTES_PER_UNIT) as usize
}

/// Start offset of a region.
pub fn region_offset(region: u64) -> u64 {
    AMAP_FIRST_OFFSET + region * REGION_SIZE
}

/// Map pages a region hosts besides its allocation map page.
fn reserved_pages(region: u64) -> Vec<(PageType, u64)> {
    let start = region_offset(region);
    let mut pages = Vec::new();
    if region % PMAP_REGION_INTERVAL == 0 {
        pages.push((PageType::PageMap, start + PAGE_SIZE as u64));
    }
    if region >= FMAP_FIRST_REGION && (region - FMAP_FIRST_REGION) % FMAP_REGION_INTERVAL == 0 {
        pages.push((PageType::FreeMap, start + 2 * PAGE_SIZE as u64));
    }
    if region >= FPMAP_FIRST_REGION && (region - FPMAP_FIRST_REGION) % FPMAP_REGION_INTERVAL == 0 {
        pages.push((PageType::FreePageMap, start + 3 * PAGE_SIZE as u64));
    }
    pages
}

/// One allocation map page.
#[derive(Clone)]
pub struct AMapPage {
    bits: [u8; PAGE_DATA_SIZE],
}

impl AMapPage {
    /// Creates a page with every unit free.
    pub fn new() -> Self {
        Self {
            bits: [0u8; PAGE_DATA_SIZE],
        }
    }

    pub fn from_bits(bits: [u8; PAGE_DATA_SIZE]) -> Self {
        Self { bits }
    }

    pub fn as_bits(&self) -> &[u8; PAGE_DATA_SIZE] {
        &self.bits
    }

    #[inline]
    fn is_unit_allocated(&self, unit: usize) -> bool {
        self.bits[unit / 8] & (0x80 >> (unit % 8)) != 0
    }

    #[inline]
    fn set_unit(&mut self, unit: usize, allocated: bool) {
        let mask = 0x80u8 >> (unit % 8);
        if allocated {
            self.bits[unit / 8] |= mask;
        } else {
            self.bits[unit / 8] &= !mask;
        }
    }

    /// Finds the first run of free units covering `len` bytes.
    ///
    /// Returns the byte offset of the run within the region. With
    /// `page_aligned` only runs starting on a 512-byte boundary count.
    pub fn find_contiguous_space(&self, len: u64, page_aligned: bool) -> Option<u64> {
        let needed = units_for(len);
        if needed == 0 || needed > UNITS_PER_REGION {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for unit in 0..UNITS_PER_REGION {
            if self.is_unit_allocated(unit) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                if page_aligned && unit % UNITS_PER_PAGE != 0 {
                    continue;
                }
                run_start = unit;
            }
            run_len += 1;
            if run_len == needed {
                return Some(run_start as u64 * BYTES_PER_UNIT);
            }
        }
        None
    }

    /// Marks every unit covering the range as allocated. Unchecked.
    pub fn allocate_space(&mut self, offset: u64, len: u64) {
        let first = (offset / BYTES_PER_UNIT) as usize;
        for unit in first..(first + units_for(len)).min(UNITS_PER_REGION) {
            self.set_unit(unit, true);
        }
    }

    /// Marks every unit covering the range as free. Unchecked.
    pub fn free_allocated_space(&mut self, offset: u64, len: u64) {
        let first = (offset / BYTES_PER_UNIT) as usize;
        for unit in first..(first + units_for(len)).min(UNITS_PER_REGION) {
            self.set_unit(unit, false);
        }
    }

    /// True if every unit covering the range is allocated.
    pub fn is_range_allocated(&self, offset: u64, len: u64) -> bool {
        let first = (offset / BYTES_PER_UNIT) as usize;
        let last = first + units_for(len);
        last <= UNITS_PER_REGION && (first..last).all(|unit| self.is_unit_allocated(unit))
    }

    /// Longest run of free units, in bytes.
    pub fn max_contiguous_space(&self) -> u64 {
        let mut best = 0;
        let mut run = 0;
        for unit in 0..UNITS_PER_REGION {
            if self.is_unit_allocated(unit) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best as u64 * BYTES_PER_UNIT
    }

    /// Free bytes in the region.
    pub fn free_space(&self) -> u64 {
        let used: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        (UNITS_PER_REGION as u64 - used as u64) * BYTES_PER_UNIT
    }
}

impl Default for AMapPage {
    fn default() -> Self {
        Self::new()
    }
}

struct Region {
    page: AMapPage,
    dirty: bool,
    /// Reserved map pages not yet written to disk.
    fresh: bool,
}

/// Allocation map over every region of the file.
pub struct AllocationMap {
    regions: Vec<Region>,
}

impl AllocationMap {
    /// Map for a new file: one region, nothing allocated but map pages.
    pub fn new() -> Self {
        let mut map = Self {
            regions: Vec::new(),
        };
        map.grow();
        map
    }

    /// Loads `region_count` map pages from the device.
    pub fn load(device: &dyn ByteDevice, region_count: u64) -> Result<Self> {
        let mut regions = Vec::with_capacity(region_count as usize);
        for region in 0..region_count {
            let offset = region_offset(region);
            let mut buf = [0u8; PAGE_SIZE];
            device.read_exact_at(offset, &mut buf)?;
            verify_page(&buf, PageType::AllocationMap, offset)?;
            let mut bits = [0u8; PAGE_DATA_SIZE];
            bits.copy_from_slice(&buf[..PAGE_DATA_SIZE]);
            regions.push(Region {
                page: AMapPage::from_bits(bits),
                dirty: false,
                fresh: false,
            });
        }
        if regions.is_empty() {
            return Err(MailstoreError::corrupted("file has no allocation map pages"));
        }
        debug!(regions = regions.len(), "loaded allocation map");
        Ok(Self { regions })
    }

    /// Number of regions, derived from the last map page offset.
    pub fn region_count_for(amap_last: u64) -> Result<u64> {
        if amap_last < AMAP_FIRST_OFFSET || (amap_last - AMAP_FIRST_OFFSET) % REGION_SIZE != 0 {
            return Err(MailstoreError::corrupted(format!(
                "last allocation map page at {:#x} is misplaced",
                amap_last
            )));
        }
        Ok((amap_last - AMAP_FIRST_OFFSET) / REGION_SIZE + 1)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Appends one region with its map pages already allocated.
    fn grow(&mut self) {
        let region = self.regions.len() as u64;
        let mut page = AMapPage::new();
        page.allocate_space(0, PAGE_SIZE as u64);
        for (_, offset) in reserved_pages(region) {
            page.allocate_space(offset - region_offset(region), PAGE_SIZE as u64);
        }
        debug!(region, offset = region_offset(region), "added allocation map region");
        self.regions.push(Region {
            page,
            dirty: true,
            fresh: true,
        });
    }

    /// Allocates `len` bytes, growing the file when no region has room.
    pub fn allocate(&mut self, len: u64, page_aligned: bool) -> Result<u64> {
        if len == 0 || len > REGION_SIZE - 4 * PAGE_SIZE as u64 {
            return Err(MailstoreError::InvalidArgument(format!(
                "cannot allocate {} bytes",
                len
            )));
        }
        loop {
            for (index, region) in self.regions.iter_mut().enumerate() {
                if let Some(rel) = region.page.find_contiguous_space(len, page_aligned) {
                    region.page.allocate_space(rel, len);
                    region.dirty = true;
                    let offset = region_offset(index as u64) + rel;
                    trace!(offset, len, page_aligned, "allocated space");
                    return Ok(offset);
                }
            }
            self.grow();
        }
    }

    /// Frees a range, failing if any unit of it is not allocated.
    pub fn release(&mut self, offset: u64, len: u64) -> Result<()> {
        let corrupted = || MailstoreError::AllocationMapCorrupted {
            offset,
            length: len,
        };
        if offset < AMAP_FIRST_OFFSET || offset % BYTES_PER_UNIT != 0 {
            return Err(corrupted());
        }
        let index = ((offset - AMAP_FIRST_OFFSET) / REGION_SIZE) as usize;
        let rel = offset - region_offset(index as u64);
        let region = self.regions.get_mut(index).ok_or_else(corrupted)?;
        // The map page itself is never released.
        if rel < PAGE_SIZE as u64 || !region.page.is_range_allocated(rel, len) {
            return Err(corrupted());
        }
        region.page.free_allocated_space(rel, len);
        region.dirty = true;
        trace!(offset, len, "released space");
        Ok(())
    }

    /// True if every unit of the range is allocated.
    pub fn is_allocated(&self, offset: u64, len: u64) -> bool {
        if offset < AMAP_FIRST_OFFSET {
            return false;
        }
        let index = ((offset - AMAP_FIRST_OFFSET) / REGION_SIZE) as usize;
        let rel = offset - region_offset(index as u64);
        self.regions
            .get(index)
            .is_some_and(|r| r.page.is_range_allocated(rel, len))
    }

    /// Total free bytes across all regions.
    pub fn free_space(&self) -> u64 {
        self.regions.iter().map(|r| r.page.free_space()).sum()
    }

    /// Largest free run in any single region.
    pub fn max_contiguous_space(&self) -> u64 {
        self.regions
            .iter()
            .map(|r| r.page.max_contiguous_space())
            .max()
            .unwrap_or(0)
    }

    /// Offset of the last map page.
    pub fn last_page_offset(&self) -> u64 {
        region_offset(self.regions.len() as u64 - 1)
    }

    /// End of the last region.
    pub fn file_eof(&self) -> u64 {
        region_offset(self.regions.len() as u64)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.regions.iter().any(|r| r.dirty)
    }

    /// Writes dirty map pages and extends the device to cover every region.
    pub fn flush(&mut self, device: &dyn ByteDevice) -> Result<()> {
        let eof = self.file_eof();
        if device.len_bytes()? < eof {
            device.set_len(eof)?;
        }
        let mut written = 0usize;
        for (index, region) in self.regions.iter_mut().enumerate() {
            let offset = region_offset(index as u64);
            if region.fresh {
                for (page_type, page_offset) in reserved_pages(index as u64) {
                    let mut buf = [0u8; PAGE_SIZE];
                    if page_type == PageType::PageMap {
                        buf[..PAGE_DATA_SIZE].fill(0xFF);
                    }
                    seal_page(&mut buf, page_type, BlockId(page_offset), page_offset);
                    device.write_all_at(page_offset, &buf)?;
                }
                region.fresh = false;
            }
            if region.dirty {
                let mut buf = [0u8; PAGE_SIZE];
                buf[..PAGE_DATA_SIZE].copy_from_slice(region.page.as_bits());
                seal_page(&mut buf, PageType::AllocationMap, BlockId(offset), offset);
                device.write_all_at(offset, &buf)?;
                region.dirty = false;
                written += 1;
            }
        }
        trace!(pages = written, "flushed allocation map");
        Ok(())
    }
}

impl Default for AllocationMap {
    fn default() -> Self {
        Self::new()
    }
}
