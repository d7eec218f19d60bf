//! The single-file VHD backend.

use chrono::Utc;
use slog::{debug, info, o, warn, Logger};
use snafu::{ensure, ResultExt};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use repr::header::encode_utf16_le;
use repr::{
    bat_size_bytes, Chs, DiskType, Features, Footer, Header, ParentLocatorEntry, PlatformCode,
    Timestamp, U32, U64, BLOCK_UNUSED, FILE_FORMAT_VERSION, FOOTER_SIZE, HEADER_SIZE,
    HEADER_VERSION, PARENT_LOCATOR_ENTRIES, SECTOR_SIZE,
};

use crate::bitmap;
use crate::errors::{
    AssertionSnafu, BlockAbsentSnafu, FooterMismatchSnafu, Result, UnableToOpenSnafu,
};
use crate::handler::{relative_path, FileIo, Handler, OpenMode};
use crate::vhd::{
    bytes_to_sectors_ceil, pack_footer, pack_header, sectors_to_bytes, unpack_footer,
    unpack_header, Bat, Block, Geometry, Vhd,
};

/// A sparse VHD backed by one file.
///
/// The footer, header and BAT are owned in memory and written back through
/// the positional-I/O handle; the handle is closed when the value drops, so
/// every open is released on all exit paths.
pub struct VhdFile {
    file: Box<dyn FileIo>,
    path: PathBuf,
    pub(crate) footer: Footer,
    pub(crate) header: Header,
    geometry: Geometry,
    bat: Bat,
    logger: Logger,
}

impl VhdFile {
    /// Open an existing image read/write, eagerly validating both records
    /// and loading the BAT
    pub fn open(handler: &dyn Handler, path: &Path) -> Result<VhdFile> {
        Self::open_with_logger(handler, path, true, crate::default_logger())
    }

    /// [`open`](#method.open), with control over the end-footer comparison
    /// (relaxed when resuming an interrupted merge) and the logger
    pub fn open_with_logger(
        handler: &dyn Handler,
        path: &Path,
        check_second_footer: bool,
        logger: Logger,
    ) -> Result<VhdFile> {
        let logger = logger.new(o!("file" => path.display().to_string()));
        let mut file = handler
            .open(path, OpenMode::ReadWrite)
            .context(UnableToOpenSnafu { path })?;
        let (footer, header) = Self::load_records(file.as_mut(), check_second_footer)?;

        info!(logger, "read VHD records";
            "disk_type" => ?footer.disk_type(),
            "current_size" => footer.current_size.get(),
            "block_size" => header.block_size.get(),
            "max_table_entries" => header.max_table_entries.get(),
            "table_offset" => header.table_offset.get(),
            "parent" => header.parent_unicode_name(),
        );

        let geometry = Geometry::from_header(&header);
        let mut vhd = VhdFile {
            file,
            path: path.to_path_buf(),
            footer,
            header,
            geometry,
            bat: Bat::empty(),
            logger,
        };
        vhd.read_block_allocation_table()?;
        Ok(vhd)
    }

    /// Create an empty dynamic image of `size` bytes
    pub fn create_dynamic(
        handler: &dyn Handler,
        path: &Path,
        size: u64,
        block_size: u32,
    ) -> Result<VhdFile> {
        let mut vhd = Self::create_base(handler, path, size, block_size, DiskType::DYNAMIC)?;
        vhd.write_block_allocation_table()?;
        vhd.write_header()?;
        vhd.write_footer(false)?;
        Ok(vhd)
    }

    /// Create an empty differencing image on top of `parent_path`, copying
    /// size and block geometry from the parent
    pub fn create_differencing(
        handler: &dyn Handler,
        path: &Path,
        parent_path: &Path,
    ) -> Result<VhdFile> {
        let parent = VhdFile::open(handler, parent_path)?;
        let mut vhd = Self::create_base(
            handler,
            path,
            parent.footer.current_size.get(),
            parent.header.block_size.get(),
            DiskType::DIFFERENCING,
        )?;

        vhd.header.parent_unique_id = parent.footer.unique_id;
        vhd.header.parent_timestamp = U32::new(parent.footer.timestamp.get());
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let parent_name = relative_path(dir, parent_path);
        ensure!(
            vhd.header.set_parent_unicode_name(&parent_name),
            AssertionSnafu {
                message: format!("parent name {:?} does not fit the header", parent_name),
            }
        );

        vhd.write_block_allocation_table()?;
        vhd.set_unique_parent_locator(&parent_name)?;
        vhd.write_header()?;
        vhd.write_footer(false)?;
        Ok(vhd)
    }

    fn create_base(
        handler: &dyn Handler,
        path: &Path,
        size: u64,
        block_size: u32,
        disk_type: DiskType,
    ) -> Result<VhdFile> {
        ensure!(
            block_size.is_power_of_two() && block_size >= SECTOR_SIZE as u32,
            AssertionSnafu {
                message: format!("block size {} is not a power of two", block_size),
            }
        );

        let logger = crate::default_logger().new(o!("file" => path.display().to_string()));
        let file = handler
            .open(path, OpenMode::ExclusiveCreate)
            .context(UnableToOpenSnafu { path })?;

        let blocks = (size + u64::from(block_size) - 1) / u64::from(block_size);
        let max_table_entries = u32::try_from(blocks).map_err(|_| {
            crate::errors::VhdError::Assertion {
                message: format!("disk size {} needs more BAT entries than the format allows", size),
            }
        })?;

        let table_offset = FOOTER_SIZE + HEADER_SIZE;
        let timestamp = timestamp_now(&logger);

        let footer = Footer {
            cookie: repr::footer::COOKIE,
            features: U32::new(Features::RESERVED.bits()),
            file_format_version: U32::new(FILE_FORMAT_VERSION),
            data_offset: U64::new(FOOTER_SIZE),
            timestamp: U32::new(timestamp.0),
            creator_application: *b"vhdr",
            creator_version: U32::new(0x0001_0000),
            creator_host_os: U32::new(u32::from_be_bytes(*b"Wi2k")),
            original_size: U64::new(size),
            current_size: U64::new(size),
            disk_geometry: U32::new(Chs::for_size(size).pack()),
            disk_type: U32::new(disk_type.0),
            checksum: U32::new(0),
            unique_id: fresh_unique_id(),
            saved_state: 0,
            reserved: [0; 427],
        };
        let header = Header {
            cookie: repr::header::COOKIE,
            data_offset: U64::new(u64::MAX),
            table_offset: U64::new(table_offset),
            header_version: U32::new(HEADER_VERSION),
            max_table_entries: U32::new(max_table_entries),
            block_size: U32::new(block_size),
            checksum: U32::new(0),
            parent_unique_id: [0; 16],
            parent_timestamp: U32::new(0),
            reserved1: U32::new(0),
            parent_unicode_name: [0; 512],
            parent_locators: [ParentLocatorEntry::default(); PARENT_LOCATOR_ENTRIES],
            reserved2: [0; 256],
        };

        info!(logger, "creating VHD";
            "disk_type" => ?disk_type,
            "size" => size,
            "block_size" => block_size,
            "max_table_entries" => max_table_entries,
        );

        let geometry = Geometry::from_header(&header);
        let bat = Bat::from_bytes(vec![0xFF; bat_size_bytes(max_table_entries) as usize]);
        Ok(VhdFile {
            file,
            path: path.to_path_buf(),
            footer,
            header,
            geometry,
            bat,
            logger,
        })
    }

    fn load_records(
        file: &mut dyn FileIo,
        check_second_footer: bool,
    ) -> Result<(Footer, Header)> {
        let mut buf = vec![0u8; (FOOTER_SIZE + HEADER_SIZE) as usize];
        if let Err(e) = file.read_exact_at(0, &mut buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(crate::errors::VhdError::Truncated { len: file.len()? }.into());
            }
            return Err(e.into());
        }
        let footer = unpack_footer(&buf[..FOOTER_SIZE as usize])?;
        let header = unpack_header(&buf[FOOTER_SIZE as usize..], &footer)?;

        if check_second_footer {
            let len = file.len()?;
            let mut end = [0u8; FOOTER_SIZE as usize];
            file.read_exact_at(len - FOOTER_SIZE, &mut end)?;
            ensure!(end[..] == buf[..FOOTER_SIZE as usize], FooterMismatchSnafu);
        }
        Ok((footer, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assigning a header and recomputing the cached geometry is one step so
    /// the derivations can never go stale
    fn set_header(&mut self, header: Header) {
        self.geometry = Geometry::from_header(&header);
        self.header = header;
    }

    /// First byte past the footer, header, BAT and any parent locator data
    fn end_of_headers(&self) -> u64 {
        let mut end = FOOTER_SIZE + HEADER_SIZE;
        end = end.max(self.header.table_offset.get() + self.bat_size());
        for index in 0..PARENT_LOCATOR_ENTRIES {
            let entry = self.header.parent_locators[index];
            if entry.is_used() {
                let entry_end = entry.platform_data_offset.get()
                    + sectors_to_bytes(u64::from(entry.platform_data_space.get()));
                end = end.max(entry_end);
            }
        }
        end
    }

    /// First byte past every allocated block (sector aligned)
    fn end_of_data(&self) -> u64 {
        let mut end_sector = bytes_to_sectors_ceil(self.end_of_headers());
        let block_sectors = u64::from(self.geometry.sectors_of_full_block());
        for (_, sector) in self.bat.allocated(self.header.max_table_entries.get()) {
            end_sector = end_sector.max(u64::from(sector) + block_sectors);
        }
        sectors_to_bytes(end_sector)
    }

    /// The allocated blocks with the lowest and highest sector addresses:
    /// `(first_id, first_sector, last_sector)`
    fn first_and_last_blocks(&self) -> Option<(u32, u32, u32)> {
        let mut first: Option<(u32, u32)> = None;
        let mut last: Option<u32> = None;
        for (id, sector) in self.bat.allocated(self.header.max_table_entries.get()) {
            if first.map_or(true, |(_, s)| sector < s) {
                first = Some((id, sector));
            }
            if last.map_or(true, |s| sector > s) {
                last = Some(sector);
            }
        }
        first.map(|(id, sector)| (id, sector, last.unwrap_or(sector)))
    }

    /// Persist one BAT slot (4 bytes) from the in-memory table
    fn write_bat_entry(&mut self, id: u32) -> Result<()> {
        let offset = self.header.table_offset.get() + u64::from(id) * 4;
        let raw = self.bat.entry(id).to_be_bytes();
        self.file.write_all_at(offset, &raw)?;
        Ok(())
    }

    /// Relocate leading blocks until `space_needed` bytes past the end of
    /// the BAT are free. After every relocation the end footer is rewritten,
    /// so an interruption leaves a valid file bound to the new end of data.
    fn free_first_block_space(&mut self, space_needed: u64) -> Result<()> {
        let mut needed = space_needed;
        while needed > 0 {
            let (first_id, first_sector, last_sector) = match self.first_and_last_blocks() {
                Some(blocks) => blocks,
                None => break,
            };
            let table_end = self.header.table_offset.get() + self.bat_size();
            if table_end + needed <= sectors_to_bytes(u64::from(first_sector)) {
                break;
            }

            let target_sector = (u64::from(last_sector)
                + u64::from(self.geometry.sectors_of_full_block()))
            .max(bytes_to_sectors_ceil(table_end + needed));
            let target_sector = u32::try_from(target_sector).map_err(|_| {
                crate::errors::VhdError::Assertion {
                    message: format!("relocation target sector {} overflows the BAT", target_sector),
                }
            })?;

            debug!(self.logger, "relocating block";
                "id" => first_id,
                "from_sector" => first_sector,
                "to_sector" => target_sector,
            );

            let block = self.read_block(first_id, false)?;
            self.file
                .write_all_at(sectors_to_bytes(u64::from(target_sector)), block.buffer())?;
            self.bat.set_entry(first_id, target_sector);
            self.write_bat_entry(first_id)?;
            self.write_footer(true)?;

            needed = needed.saturating_sub(u64::from(self.geometry.full_block_size()));
        }
        Ok(())
    }

    /// Allocate a block at the end of data. The bitmap and data are not
    /// pre-zeroed; callers must write them in the same logical operation.
    pub(crate) fn create_block(&mut self, id: u32) -> Result<u32> {
        ensure!(
            self.bat.entry(id) == BLOCK_UNUSED,
            AssertionSnafu {
                message: format!("block {} is already allocated", id),
            }
        );
        ensure!(
            id < self.header.max_table_entries.get(),
            AssertionSnafu {
                message: format!("block {} is beyond the table", id),
            }
        );
        let sector = bytes_to_sectors_ceil(self.end_of_data());
        let sector = u32::try_from(sector).map_err(|_| crate::errors::VhdError::Assertion {
            message: format!("block sector {} overflows the BAT", sector),
        })?;
        debug!(self.logger, "allocating block"; "id" => id, "sector" => sector);
        self.bat.set_entry(id, sector);
        self.write_bat_entry(id)?;
        Ok(sector)
    }

    /// Write `sectors` of `data` (a full-block-sized scratch buffer) into
    /// block `id`, allocating it and updating its bitmap as needed
    pub(crate) fn write_block_sectors(&mut self, id: u32, data: &[u8], sectors: Range<u32>) -> Result<()> {
        let bitmap_size = self.geometry.bitmap_size() as usize;
        let (block_sector, mut bitmap) = match self.bat.entry(id) {
            BLOCK_UNUSED => (self.create_block(id)?, vec![0u8; bitmap_size]),
            sector => {
                let block = self.read_block(id, true)?;
                (sector, block.bitmap().to_vec())
            }
        };
        bitmap::set_range(&mut bitmap, sectors.clone());

        let base = sectors_to_bytes(u64::from(block_sector));
        self.file.write_all_at(base, &bitmap)?;
        let data_offset = base + bitmap_size as u64 + sectors_to_bytes(u64::from(sectors.start));
        let slice = &data[sectors.start as usize * SECTOR_SIZE as usize
            ..sectors.end as usize * SECTOR_SIZE as usize];
        self.file.write_all_at(data_offset, slice)?;
        Ok(())
    }

    /// Write sector-aligned data at `offset_sectors`, splitting it across
    /// blocks and allocating them as needed. Both footer copies are
    /// rewritten once all blocks are in place.
    pub fn write_data(&mut self, offset_sectors: u64, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() % SECTOR_SIZE as usize == 0,
            AssertionSnafu {
                message: format!("write of {} bytes is not sector aligned", data.len()),
            }
        );
        let sectors_per_block = u64::from(self.geometry.sectors_per_block);
        let end_sectors = offset_sectors + data.len() as u64 / SECTOR_SIZE;
        let first_block = offset_sectors / sectors_per_block;
        let last_block = (end_sectors + sectors_per_block - 1) / sectors_per_block;
        ensure!(
            last_block <= u64::from(self.header.max_table_entries.get()),
            AssertionSnafu {
                message: format!(
                    "write through sector {} exceeds the virtual disk",
                    end_sectors
                ),
            }
        );

        for block_id in first_block..last_block {
            let block_start = block_id * sectors_per_block;
            let start_in_block = offset_sectors.max(block_start) - block_start;
            let end_in_block = end_sectors.min(block_start + sectors_per_block) - block_start;
            let start_in_buf =
                ((block_start + start_in_block - offset_sectors) * SECTOR_SIZE) as usize;
            let end_in_buf = ((block_start + end_in_block - offset_sectors) * SECTOR_SIZE) as usize;
            let slice = &data[start_in_buf..end_in_buf];

            if start_in_block == 0 && end_in_block == sectors_per_block {
                let mut bitmap = vec![0u8; self.geometry.bitmap_size() as usize];
                bitmap::set_range(&mut bitmap, 0..self.geometry.sectors_per_block);
                let block = Block::assemble(block_id as u32, bitmap, slice);
                self.write_entire_block(&block)?;
            } else {
                let mut scratch = vec![0u8; self.geometry.block_size as usize];
                scratch[(start_in_block * SECTOR_SIZE) as usize
                    ..(end_in_block * SECTOR_SIZE) as usize]
                    .copy_from_slice(slice);
                self.write_block_sectors(
                    block_id as u32,
                    &scratch,
                    start_in_block as u32..end_in_block as u32,
                )?;
            }
        }
        self.write_footer(false)
    }

    /// Read sector-aligned data at `offset_sectors`. Sectors that are absent
    /// or not set in their block's bitmap read as zeros; parents of
    /// differencing images are not consulted.
    pub fn read_data(&mut self, offset_sectors: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() % SECTOR_SIZE as usize == 0,
            AssertionSnafu {
                message: format!("read of {} bytes is not sector aligned", buf.len()),
            }
        );
        buf.fill(0);
        let sectors_per_block = u64::from(self.geometry.sectors_per_block);
        let end_sectors = offset_sectors + buf.len() as u64 / SECTOR_SIZE;
        let first_block = offset_sectors / sectors_per_block;
        let last_block = (end_sectors + sectors_per_block - 1) / sectors_per_block;

        for block_id in first_block..last_block {
            if !self.contains_block(block_id as u32) {
                continue;
            }
            let block = self.read_block(block_id as u32, false)?;
            let block_start = block_id * sectors_per_block;
            let start_in_block = offset_sectors.max(block_start) - block_start;
            let end_in_block = end_sectors.min(block_start + sectors_per_block) - block_start;
            for sector in start_in_block..end_in_block {
                if !bitmap::test(block.bitmap(), sector as u32) {
                    continue;
                }
                let src = (sector * SECTOR_SIZE) as usize;
                let dst = ((block_start + sector - offset_sectors) * SECTOR_SIZE) as usize;
                buf[dst..dst + SECTOR_SIZE as usize]
                    .copy_from_slice(&block.data()[src..src + SECTOR_SIZE as usize]);
            }
        }
        Ok(())
    }

    /// Make room between the header and the BAT for `needed_sectors` of
    /// parent locator data, pushing the BAT (and blocks) forward when the
    /// gap is too small. Returns the byte position of the locator area.
    fn ensure_space_for_parent_locators(&mut self, needed_sectors: u64) -> Result<u64> {
        let position = FOOTER_SIZE + HEADER_SIZE;
        let table_offset = self.header.table_offset.get();
        let available = table_offset.saturating_sub(position);
        let needed = sectors_to_bytes(needed_sectors);
        if available < needed {
            let deficit = needed - available;
            self.free_first_block_space(deficit)?;
            self.header.table_offset.set(table_offset + deficit);
            self.write_block_allocation_table()?;
        }
        Ok(position)
    }
}

fn fresh_unique_id() -> [u8; 16] {
    let mut id: [u8; 16] = rand::random();
    // RFC 4122 version 4 bits, matching what other implementations emit
    id[6] = (id[6] & 0x0F) | 0x40;
    id[8] = (id[8] & 0x3F) | 0x80;
    id
}

fn timestamp_now(logger: &Logger) -> Timestamp {
    match Timestamp::from_datetime(Utc::now()) {
        Some(timestamp) => timestamp,
        None => {
            warn!(logger, "current time is out of range for the format; storing the epoch");
            Timestamp(0)
        }
    }
}

impl Vhd for VhdFile {
    fn footer(&self) -> &Footer {
        &self.footer
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn bat_size(&self) -> u64 {
        bat_size_bytes(self.header.max_table_entries.get())
    }

    fn read_header_and_footer(&mut self, check_second_footer: bool) -> Result<()> {
        let (footer, header) = Self::load_records(self.file.as_mut(), check_second_footer)?;
        self.footer = footer;
        self.set_header(header);
        Ok(())
    }

    fn read_block_allocation_table(&mut self) -> Result<()> {
        let entries = self.header.max_table_entries.get();
        let mut buf = vec![0u8; entries as usize * 4];
        self.file
            .read_exact_at(self.header.table_offset.get(), &mut buf)?;
        self.bat = Bat::from_bytes(buf);
        Ok(())
    }

    fn contains_block(&self, id: u32) -> bool {
        self.bat.entry(id) != BLOCK_UNUSED
    }

    fn read_block(&mut self, id: u32, only_bitmap: bool) -> Result<Block> {
        let sector = self.bat.entry(id);
        ensure!(sector != BLOCK_UNUSED, BlockAbsentSnafu { id });
        let bitmap_size = self.geometry.bitmap_size() as usize;
        let read_size = if only_bitmap {
            bitmap_size
        } else {
            self.geometry.full_block_size() as usize
        };
        let mut buf = vec![0u8; read_size];
        self.file
            .read_exact_at(sectors_to_bytes(u64::from(sector)), &mut buf)?;
        Ok(Block::new(id, bitmap_size, buf))
    }

    fn ensure_bat_size(&mut self, entries: u32) -> Result<()> {
        let current_entries = self.header.max_table_entries.get();
        if entries <= current_entries {
            return Ok(());
        }
        let current_bat_size = bat_size_bytes(current_entries);
        let new_bat_size = bat_size_bytes(entries);

        info!(self.logger, "growing BAT";
            "entries" => entries,
            "from_entries" => current_entries,
            "bytes" => new_bat_size - current_bat_size,
        );

        if new_bat_size > current_bat_size {
            self.free_first_block_space(new_bat_size - current_bat_size)?;
        }
        self.bat.grow(new_bat_size as usize);
        if new_bat_size > current_bat_size {
            let tail_offset = self.header.table_offset.get() + current_bat_size;
            self.file
                .write_all_at(tail_offset, &self.bat.bytes()[current_bat_size as usize..])?;
        }
        self.header.max_table_entries.set(entries);
        self.write_header()
    }

    fn write_entire_block(&mut self, block: &Block) -> Result<()> {
        ensure!(
            block.buffer().len() == self.geometry.full_block_size() as usize,
            AssertionSnafu {
                message: format!(
                    "block {} buffer is {} bytes, expected {}",
                    block.id(),
                    block.buffer().len(),
                    self.geometry.full_block_size()
                ),
            }
        );
        let sector = match self.bat.entry(block.id()) {
            BLOCK_UNUSED => self.create_block(block.id())?,
            sector => sector,
        };
        self.file
            .write_all_at(sectors_to_bytes(u64::from(sector)), block.buffer())?;
        Ok(())
    }

    fn coalesce_block(&mut self, child: &mut dyn Vhd, id: u32) -> Result<u64> {
        ensure!(
            child.geometry().block_size == self.geometry.block_size,
            AssertionSnafu {
                message: format!(
                    "child block size {} differs from parent block size {}",
                    child.geometry().block_size,
                    self.geometry.block_size
                ),
            }
        );
        let child_block = child.read_block(id, false)?;
        let sectors_per_block = self.geometry.sectors_per_block;
        let bitmap_size = self.geometry.bitmap_size() as usize;

        let mut merged_sectors = 0u64;
        // The parent bitmap is read (or zero-initialized on allocation) once
        // per call and reused across runs
        let mut own_bitmap: Option<Vec<u8>> = None;

        for run in bitmap::Runs::new(child_block.bitmap(), sectors_per_block) {
            merged_sectors += u64::from(run.end - run.start);
            if run.start == 0 && run.end == sectors_per_block {
                self.write_entire_block(&child_block)?;
                continue;
            }

            if own_bitmap.is_none() {
                own_bitmap = Some(match self.bat.entry(id) {
                    BLOCK_UNUSED => {
                        self.create_block(id)?;
                        vec![0u8; bitmap_size]
                    }
                    _ => self.read_block(id, true)?.bitmap().to_vec(),
                });
            }
            let bitmap = own_bitmap.get_or_insert_with(Vec::new);
            bitmap::set_range(bitmap, run.clone());

            let base = sectors_to_bytes(u64::from(self.bat.entry(id)));
            self.file.write_all_at(base, bitmap)?;
            let data_offset =
                base + bitmap_size as u64 + sectors_to_bytes(u64::from(run.start));
            let slice = &child_block.data()[run.start as usize * SECTOR_SIZE as usize
                ..run.end as usize * SECTOR_SIZE as usize];
            self.file.write_all_at(data_offset, slice)?;
        }

        debug!(self.logger, "coalesced block";
            "id" => id,
            "sectors" => merged_sectors,
        );
        Ok(merged_sectors * SECTOR_SIZE)
    }

    fn write_footer(&mut self, only_end_footer: bool) -> Result<()> {
        let packed = pack_footer(&mut self.footer);
        let end_of_data = self.end_of_data();
        let len = self.file.len()?;
        let position = end_of_data.max(len.saturating_sub(FOOTER_SIZE));
        self.file.write_all_at(position, &packed)?;
        if !only_end_footer {
            self.file.write_all_at(0, &packed)?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let packed = pack_header(&mut self.header);
        self.file.write_all_at(FOOTER_SIZE, &packed)?;
        Ok(())
    }

    fn write_block_allocation_table(&mut self) -> Result<()> {
        let table_offset = self.header.table_offset.get();
        let bytes = self.bat.bytes().to_vec();
        self.file.write_all_at(table_offset, &bytes)?;
        Ok(())
    }

    fn set_unique_parent_locator(&mut self, path: &str) -> Result<()> {
        let data = encode_utf16_le(path);
        let needed_sectors = bytes_to_sectors_ceil(data.len() as u64).max(1);
        let position = self.ensure_space_for_parent_locators(needed_sectors)?;
        self.file.write_all_at(position, &data)?;

        self.header.parent_locators[0] = ParentLocatorEntry {
            platform_code: U32::new(PlatformCode::W2KU.0),
            platform_data_space: U32::new(sectors_to_bytes(needed_sectors) as u32),
            platform_data_length: U32::new(data.len() as u32),
            reserved: U32::new(0),
            platform_data_offset: U64::new(position),
        };
        for index in 1..PARENT_LOCATOR_ENTRIES {
            self.header.parent_locators[index] = ParentLocatorEntry::default();
        }
        Ok(())
    }

    fn read_parent_locator_data(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        ensure!(
            index < PARENT_LOCATOR_ENTRIES,
            AssertionSnafu {
                message: format!("parent locator {} is out of range", index),
            }
        );
        let entry = self.header.parent_locators[index];
        if entry.platform_data_space.get() == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; entry.platform_data_length.get() as usize];
        self.file
            .read_exact_at(entry.platform_data_offset.get(), &mut buf)?;
        Ok(Some(buf))
    }

    fn write_parent_locator(&mut self, index: usize, data: &[u8]) -> Result<()> {
        ensure!(
            index < PARENT_LOCATOR_ENTRIES,
            AssertionSnafu {
                message: format!("parent locator {} is out of range", index),
            }
        );
        let entry = self.header.parent_locators[index];
        ensure!(
            entry.is_used(),
            AssertionSnafu {
                message: format!("parent locator {} reserves no space", index),
            }
        );
        self.file
            .write_all_at(entry.platform_data_offset.get(), data)?;
        self.header.parent_locators[index]
            .platform_data_length
            .set(data.len() as u32);
        Ok(())
    }
}

impl fmt::Debug for VhdFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VhdFile")
            .field("path", &self.path)
            .field("footer", &self.footer)
            .field("header", &self.header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LocalHandler;
    use repr::header::decode_utf16_le;

    const MIB: u64 = 1024 * 1024;

    fn footer_copies(path: &Path) -> (Vec<u8>, Vec<u8>) {
        let raw = std::fs::read(path).unwrap();
        let primary = raw[..512].to_vec();
        let end = raw[raw.len() - 512..].to_vec();
        (primary, end)
    }

    #[test]
    fn created_image_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE).unwrap();

        let vhd = VhdFile::open(&handler, &path).unwrap();
        assert_eq!(vhd.footer().disk_type(), DiskType::DYNAMIC);
        assert_eq!(vhd.footer().current_size.get(), 2 * MIB);
        assert_eq!(vhd.header().max_table_entries.get(), 1);
        assert!(!vhd.contains_block(0));

        let (primary, end) = footer_copies(&path);
        assert_eq!(primary, end);
    }

    #[test]
    fn empty_table_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.vhd");
        let handler = LocalHandler;
        VhdFile::create_dynamic(&handler, &path, 0, repr::DEFAULT_BLOCK_SIZE).unwrap();

        let vhd = VhdFile::open(&handler, &path).unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 0);
        assert!(!vhd.contains_block(0));
        // the BAT still occupies one padded sector
        assert_eq!(vhd.bat_size(), 512);
    }

    #[test]
    fn partial_write_sets_bitmap_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd =
            VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE).unwrap();

        vhd.write_data(0, &[0xAA; 512]).unwrap();

        assert!(vhd.contains_block(0));
        let block = vhd.read_block(0, false).unwrap();
        assert!(bitmap::test(block.bitmap(), 0));
        assert!(!bitmap::test(block.bitmap(), 1));
        assert!(block.data()[..512].iter().all(|&b| b == 0xAA));
        assert!(block.data()[512..].iter().all(|&b| b == 0x00));

        let (primary, end) = footer_copies(&path);
        assert_eq!(primary, end);
    }

    #[test]
    fn later_writes_win_on_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd = VhdFile::create_dynamic(&handler, &path, 16 * 512, 4 * 512).unwrap();

        vhd.write_data(0, &[0x11; 4 * 512]).unwrap(); // full block 0
        vhd.write_data(2, &[0x22; 4 * 512]).unwrap(); // spans blocks 0 and 1

        let mut read = vec![0u8; 6 * 512];
        vhd.read_data(0, &mut read).unwrap();
        assert!(read[..2 * 512].iter().all(|&b| b == 0x11));
        assert!(read[2 * 512..6 * 512].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn unwritten_sectors_read_as_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd = VhdFile::create_dynamic(&handler, &path, 16 * 512, 4 * 512).unwrap();

        vhd.write_data(5, &[0x33; 512]).unwrap();

        let mut read = vec![0u8; 8 * 512];
        vhd.read_data(0, &mut read).unwrap();
        assert!(read[..5 * 512].iter().all(|&b| b == 0));
        assert!(read[5 * 512..6 * 512].iter().all(|&b| b == 0x33));
        assert!(read[6 * 512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reading_an_absent_block_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd =
            VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE).unwrap();
        let err = vhd.read_block(0, false).unwrap_err();
        assert!(err.to_string().contains("not allocated"));
    }

    #[test]
    fn bat_growth_preserves_entries_and_relocates_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        // Single-sector blocks make relocation cheap to exercise
        let mut vhd = VhdFile::create_dynamic(&handler, &path, 4 * 512, 512).unwrap();

        for sector in 0..4u64 {
            let fill = 0x10 * (sector as u8 + 1);
            vhd.write_data(sector, &[fill; 512]).unwrap();
        }
        let before: Vec<u32> = (0..4).map(|id| vhd.bat.entry(id)).collect();
        assert!(before.iter().all(|&sector| sector != BLOCK_UNUSED));

        // Growing to 4096 entries needs 15.5 KiB more table; every block
        // sits right after the old table and must move
        vhd.ensure_bat_size(4096).unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 4096);
        let after: Vec<u32> = (0..4).map(|id| vhd.bat.entry(id)).collect();
        assert!(after.iter().zip(&before).all(|(a, b)| a != b));
        assert!(!vhd.contains_block(4));
        assert!(!vhd.contains_block(4095));

        // Table bytes and data survive a reopen
        drop(vhd);
        let mut vhd = VhdFile::open(&handler, &path).unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 4096);
        for sector in 0..4u64 {
            let mut read = [0u8; 512];
            vhd.read_data(sector, &mut read).unwrap();
            assert!(read.iter().all(|&b| b == 0x10 * (sector as u8 + 1)));
        }
    }

    #[test]
    fn growing_within_the_padding_only_updates_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd = VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE)
            .unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 1);
        vhd.ensure_bat_size(64).unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 64);
        assert_eq!(vhd.bat_size(), 512);

        drop(vhd);
        let vhd = VhdFile::open(&handler, &path).unwrap();
        assert_eq!(vhd.header().max_table_entries.get(), 64);
        assert!(!vhd.contains_block(63));
    }

    #[test]
    fn parent_locator_growth_moves_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd = VhdFile::create_dynamic(&handler, &path, 4 * 512, 512).unwrap();
        vhd.write_data(0, &[0x77; 512]).unwrap();
        let table_before = vhd.header().table_offset.get();

        // ~600 UTF-16 code units -> 1200 bytes -> three locator sectors
        let long_name = format!("./{}.vhd", "p".repeat(600));
        vhd.set_unique_parent_locator(&long_name).unwrap();
        vhd.write_header().unwrap();
        vhd.write_footer(false).unwrap();

        assert!(vhd.header().table_offset.get() > table_before);
        let data = vhd.read_parent_locator_data(0).unwrap().unwrap();
        assert_eq!(decode_utf16_le(&data), long_name);
        assert_eq!(
            vhd.header().parent_locators[0].platform_code(),
            PlatformCode::W2KU
        );
        assert!(!vhd.header().parent_locators[1].is_used());

        // Still a valid image, and the relocated block is intact
        drop(vhd);
        let mut vhd = VhdFile::open(&handler, &path).unwrap();
        let mut read = [0u8; 512];
        vhd.read_data(0, &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0x77));
    }

    #[test]
    fn differencing_child_names_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        let handler = LocalHandler;
        VhdFile::create_dynamic(&handler, &parent_path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE)
            .unwrap();
        VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();

        let parent = VhdFile::open(&handler, &parent_path).unwrap();
        let mut child = VhdFile::open(&handler, &child_path).unwrap();
        assert_eq!(child.footer().disk_type(), DiskType::DIFFERENCING);
        assert_eq!(child.footer().current_size.get(), 2 * MIB);
        assert_eq!(child.header().parent_unique_id, parent.footer().unique_id);
        assert_eq!(
            child.header().parent_unicode_name().as_deref(),
            Some("./parent.vhd")
        );
        let locator = child.read_parent_locator_data(0).unwrap().unwrap();
        assert_eq!(decode_utf16_le(&locator), "./parent.vhd");
    }

    #[test]
    fn allocating_a_used_slot_is_a_structural_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let mut vhd =
            VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE).unwrap();
        vhd.write_data(0, &[1; 512]).unwrap();
        let err = vhd.create_block(0).unwrap_err();
        assert!(err.to_string().contains("already allocated"));
        assert!(!err.is_corrupt_image());
    }

    #[test]
    fn footer_mismatch_is_fatal_unless_relaxed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");
        let handler = LocalHandler;
        let vhd =
            VhdFile::create_dynamic(&handler, &path, 2 * MIB, repr::DEFAULT_BLOCK_SIZE).unwrap();
        drop(vhd);

        // Corrupt one byte of the end footer's reserved tail
        let raw = std::fs::read(&path).unwrap();
        let mut corrupted = raw.clone();
        let len = corrupted.len();
        corrupted[len - 1] ^= 0xFF;
        std::fs::write(&path, &corrupted).unwrap();

        let err = VhdFile::open(&handler, &path).unwrap_err();
        assert!(err.is_corrupt_image());

        let vhd =
            VhdFile::open_with_logger(&handler, &path, false, crate::default_logger()).unwrap();
        assert_eq!(vhd.footer().disk_type(), DiskType::DYNAMIC);
    }
}
