//! The kernel heap: a circular first-fit free list stored inside kernel
//! virtual memory.
//!
//! A block header is two cells, `[next, size]`: the virtual index of the
//! next free node and the payload size in cells, excluding the header.
//! Every node access is translated against the kernel page table, acquiring
//! frames on demand; the first traversal of the list is what maps kernel
//! heap pages into physical RAM.

use crate::memory::{Cell, Memory, PageTableId, PAGE_SIZE};

/// Cells occupied by a block header.
pub const HEAP_HEADER_CELLS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block can satisfy the request.
    NoLargeEnoughBlock,
    /// Demand-mapping a kernel heap page found the frame pool empty.
    OutOfFrames,
    /// The address does not belong to a live allocation.
    InvalidFree,
}

pub struct FreeListAllocator {
    /// Next-fit start point, always a node currently on the list.
    cursor: usize,
    table: PageTableId,
}

impl FreeListAllocator {
    /// Writes the initial single-block free list. The header cells are
    /// written physically; they stay visible through the kernel table
    /// because its page 0 demand-maps to frame 0.
    pub fn init(memory: &mut Memory, table: PageTableId) -> Self {
        memory.write(0, 0);
        memory.write(1, (memory.ram_size() - HEAP_HEADER_CELLS) as Cell);
        Self { cursor: 0, table }
    }

    /// Allocates `units` payload cells, returning the physical address of
    /// the payload.
    pub fn allocate(&mut self, memory: &mut Memory, units: usize) -> Result<usize, HeapError> {
        let units = units + HEAP_HEADER_CELLS;

        let start = self.cursor;
        let mut previous = start;
        let mut current = self.next_of(memory, previous)?;
        loop {
            let size = self.size_of(memory, current)?;
            if size >= units {
                let next = self.next_of(memory, current)?;
                if size == units && next != current {
                    // Exact fit: unlink; the node's header cells become the
                    // allocated block's header, its recorded size untouched.
                    self.write(memory, previous, next as Cell)?;
                    self.cursor = next;
                    return self.translate(memory, current + HEAP_HEADER_CELLS);
                }
                // Split from the high end. A sole exactly-fitting node
                // shrinks to size 0 and stays on the list, so the list is
                // never empty.
                let remaining = size - units;
                self.write(memory, current + 1, remaining as Cell)?;
                self.cursor = current;
                let block = current + remaining + HEAP_HEADER_CELLS;
                self.write(memory, block + 1, (units - HEAP_HEADER_CELLS) as Cell)?;
                return self.translate(memory, block + HEAP_HEADER_CELLS);
            }
            if current == start {
                return Err(HeapError::NoLargeEnoughBlock);
            }
            previous = current;
            current = self.next_of(memory, current)?;
        }
    }

    /// Returns the payload at `physical_address` to the free list, merging
    /// with adjacent free blocks.
    pub fn free(&mut self, memory: &mut Memory, physical_address: usize) -> Result<(), HeapError> {
        let payload = memory
            .reverse_lookup(self.table, physical_address)
            .ok_or(HeapError::InvalidFree)?;
        if payload < HEAP_HEADER_CELLS {
            return Err(HeapError::InvalidFree);
        }
        let header = payload - HEAP_HEADER_CELLS;
        let size = self.size_of(memory, header)?;

        // Find the pair of nodes bracketing the header in cyclic order
        let start = self.cursor;
        let mut current = start;
        loop {
            let next = self.next_of(memory, current)?;
            if current < header && header < next {
                break;
            }
            // The wrap-around node covers everything above it and below the
            // list head
            if current >= next && (header > current || header < next) {
                break;
            }
            current = next;
            if current == start {
                return Err(HeapError::InvalidFree);
            }
        }

        // Merge with the right neighbor when the freed block ends at it
        let right = self.next_of(memory, current)?;
        if header + size + HEAP_HEADER_CELLS == right {
            let right_size = self.size_of(memory, right)?;
            let right_next = self.next_of(memory, right)?;
            self.write(
                memory,
                header + 1,
                (size + right_size + HEAP_HEADER_CELLS) as Cell,
            )?;
            if right == current {
                // The absorbed node was the only one on the list; the freed
                // block replaces it as the sole, self-linked node.
                self.write(memory, header, header as Cell)?;
                self.cursor = header;
                return Ok(());
            }
            self.write(memory, header, right_next as Cell)?;
        } else {
            self.write(memory, header, right as Cell)?;
        }

        // Merge with the left neighbor when its end touches the header
        let left_size = self.size_of(memory, current)?;
        if current + left_size + HEAP_HEADER_CELLS == header {
            let freed_size = self.size_of(memory, header)?;
            let freed_next = self.next_of(memory, header)?;
            self.write(
                memory,
                current + 1,
                (left_size + freed_size + HEAP_HEADER_CELLS) as Cell,
            )?;
            self.write(memory, current, freed_next as Cell)?;
        } else {
            self.write(memory, current, header as Cell)?;
        }

        self.cursor = current;
        Ok(())
    }

    /// Walks the free list, returning each node as `(virtual index, size)`.
    pub fn free_blocks(&self, memory: &mut Memory) -> Result<Vec<(usize, usize)>, HeapError> {
        let mut blocks = Vec::new();
        let start = self.cursor;
        let mut current = start;
        loop {
            blocks.push((current, self.size_of(memory, current)?));
            current = self.next_of(memory, current)?;
            if current == start {
                return Ok(blocks);
            }
        }
    }

    fn translate(&self, memory: &mut Memory, virtual_address: usize) -> Result<usize, HeapError> {
        let (page_index, offset) = Memory::page_index_and_offset(virtual_address);
        let frame = match memory.mapping(self.table, page_index) {
            Some(frame) => frame,
            None => {
                log::debug!("heap: page fault on kernel page {}", page_index);
                let frame = memory.acquire_frame().ok_or(HeapError::OutOfFrames)?;
                memory.map(self.table, page_index, frame);
                frame
            },
        };
        Ok(offset + PAGE_SIZE * frame)
    }

    fn read(&self, memory: &mut Memory, virtual_address: usize) -> Result<Cell, HeapError> {
        let physical = self.translate(memory, virtual_address)?;
        Ok(memory.read(physical))
    }

    fn write(
        &self,
        memory: &mut Memory,
        virtual_address: usize,
        value: Cell,
    ) -> Result<(), HeapError> {
        let physical = self.translate(memory, virtual_address)?;
        memory.write(physical, value);
        Ok(())
    }

    fn next_of(&self, memory: &mut Memory, node: usize) -> Result<usize, HeapError> {
        Ok(self.read(memory, node)? as usize)
    }

    fn size_of(&self, memory: &mut Memory, node: usize) -> Result<usize, HeapError> {
        Ok(self.read(memory, node + 1)? as usize)
    }
}
