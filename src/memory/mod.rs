//! Physical memory, the frame allocator and the MMU view.
//!
//! RAM is a fixed array of integer cells, carved into frames of `PAGE_SIZE`
//! cells. Page tables map virtual pages onto frames; they live in a registry
//! owned by [`Memory`], and the *current* table selection is the MMU state
//! that context switches update. A frame is always either in the free pool
//! or mapped by exactly one table.

use hashbrown::HashMap;
use static_assertions::const_assert;

mod page_table;

pub use self::page_table::{PageTable, PageTableId};

/// One RAM cell. Registers, executables and heap metadata are all made of these.
pub type Cell = i64;

/// Physical memory size in cells.
pub const DEFAULT_RAM_SIZE: usize = 0x10000;
/// Page and frame size in cells.
pub const PAGE_SIZE: usize = 0x80;
/// Number of physical frames.
pub const FRAME_COUNT: usize = DEFAULT_RAM_SIZE / PAGE_SIZE;

const_assert!(DEFAULT_RAM_SIZE % PAGE_SIZE == 0);

pub type FrameIndex = usize;

pub struct Memory {
    ram: Vec<Cell>,
    free_frames: Vec<FrameIndex>,
    tables: HashMap<PageTableId, PageTable>,
    current: Option<PageTableId>,
    next_table_id: PageTableId,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            ram: vec![0; DEFAULT_RAM_SIZE],
            // Reversed so that frame 0 is handed out first. The kernel heap
            // relies on its lazily-faulted page 0 landing on frame 0.
            free_frames: (0..FRAME_COUNT).rev().collect(),
            tables: HashMap::new(),
            current: None,
            next_table_id: PageTableId::first(),
        }
    }

    /// Splits a virtual address into a page index and an offset within the page.
    pub fn page_index_and_offset(virtual_address: usize) -> (usize, usize) {
        (virtual_address / PAGE_SIZE, virtual_address % PAGE_SIZE)
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn read(&self, physical_address: usize) -> Cell {
        self.ram[physical_address]
    }

    pub fn write(&mut self, physical_address: usize, value: Cell) {
        self.ram[physical_address] = value;
    }

    /// Copies cells into a physically contiguous RAM region.
    pub fn write_block(&mut self, physical_address: usize, cells: &[Cell]) {
        self.ram[physical_address..physical_address + cells.len()].copy_from_slice(cells);
    }

    /// Creates an empty page table and returns its id.
    pub fn create_page_table(&mut self) -> PageTableId {
        let id = self.next_table_id;
        self.next_table_id = id.next();
        self.tables.insert(id, PageTable::new(FRAME_COUNT));
        id
    }

    /// Drops a page table, returning every frame it mapped to the pool.
    pub fn destroy_page_table(&mut self, id: PageTableId) {
        let table = self
            .tables
            .remove(&id)
            .expect("destroying an unknown page table");
        for frame in table.mapped_frames() {
            self.release_frame(frame);
        }
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Takes a frame from the pool, or `None` when physical memory is full.
    pub fn acquire_frame(&mut self) -> Option<FrameIndex> {
        self.free_frames.pop()
    }

    pub fn release_frame(&mut self, frame: FrameIndex) {
        debug_assert!(
            !self.free_frames.contains(&frame),
            "frame {} released twice",
            frame
        );
        self.free_frames.push(frame);
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_frames.len()
    }

    /// Frames currently mapped by any live page table.
    pub fn mapped_frame_count(&self) -> usize {
        self.tables.values().map(|table| table.mapped_count()).sum()
    }

    /// Points the MMU at another page table. Called on every context switch.
    pub fn set_current_table(&mut self, id: PageTableId) {
        debug_assert!(self.tables.contains_key(&id), "current table must be live");
        self.current = Some(id);
    }

    pub fn current_table(&self) -> Option<PageTableId> {
        self.current
    }

    /// Page table entry for a page under a named table.
    pub fn mapping(&self, table: PageTableId, page_index: usize) -> Option<FrameIndex> {
        self.tables.get(&table).and_then(|t| t.entry(page_index))
    }

    pub fn map(&mut self, table: PageTableId, page_index: usize, frame: FrameIndex) {
        self.tables
            .get_mut(&table)
            .expect("mapping into an unknown page table")
            .map(page_index, frame);
    }

    /// Translates through the current table. `None` on an unmapped page.
    pub fn resolve(&self, virtual_address: usize) -> Option<usize> {
        let table = self.current?;
        self.resolve_in(table, virtual_address)
    }

    pub fn resolve_in(&self, table: PageTableId, virtual_address: usize) -> Option<usize> {
        let (page_index, offset) = Self::page_index_and_offset(virtual_address);
        let frame = self.mapping(table, page_index)?;
        Some(offset + PAGE_SIZE * frame)
    }

    /// Inverse translation under a table. Well-defined because a frame is
    /// mapped by at most one table, at one page.
    pub fn reverse_lookup(&self, table: PageTableId, physical_address: usize) -> Option<usize> {
        let frame = physical_address / PAGE_SIZE;
        let offset = physical_address % PAGE_SIZE;
        let page_index = self.tables.get(&table)?.page_of(frame)?;
        Some(page_index * PAGE_SIZE + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_splits_and_rejoins() {
        for &(page, offset) in &[(0, 0), (1, 72), (511, 127)] {
            let virtual_address = page * PAGE_SIZE + offset;
            assert_eq!(
                Memory::page_index_and_offset(virtual_address),
                (page, offset)
            );
        }
    }

    #[test]
    fn frames_are_conserved() {
        let mut memory = Memory::new();
        assert_eq!(memory.free_frame_count(), FRAME_COUNT);

        let table = memory.create_page_table();
        let frame = memory.acquire_frame().unwrap();
        assert_eq!(frame, 0);
        memory.map(table, 7, frame);
        assert_eq!(
            memory.free_frame_count() + memory.mapped_frame_count(),
            FRAME_COUNT
        );

        memory.destroy_page_table(table);
        assert_eq!(memory.free_frame_count(), FRAME_COUNT);
    }

    #[test]
    fn acquire_and_release_are_inverses() {
        let mut memory = Memory::new();
        let first = memory.acquire_frame().unwrap();
        let second = memory.acquire_frame().unwrap();
        memory.release_frame(second);
        memory.release_frame(first);
        assert_eq!(memory.acquire_frame(), Some(first));
        assert_eq!(memory.acquire_frame(), Some(second));
    }

    #[test]
    fn reverse_lookup_inverts_resolve() {
        let mut memory = Memory::new();
        let table = memory.create_page_table();
        let frame = memory.acquire_frame().unwrap();
        memory.map(table, 3, frame);

        let virtual_address = 3 * PAGE_SIZE + 5;
        let physical = memory.resolve_in(table, virtual_address).unwrap();
        assert_eq!(memory.reverse_lookup(table, physical), Some(virtual_address));
        assert_eq!(memory.resolve_in(table, 0), None);
    }
}
