use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<Vec<addr>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

impl FreeEntries {
    fn new() -> FreeEntries {
        FreeEntries {
            sizes: BTreeMap::new(),
            addrs: BTreeMap::new(),
        }
    }

    fn insert(&mut self, addr: usize, size: usize) {
        self.addrs.insert(addr, size);
        self.sizes
            .entry(size)
            .or_insert_with(IndexSet::new)
            .insert(addr);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut remove_size = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.remove(&addr);
            remove_size = addrs.is_empty();
        }
        if remove_size {
            self.sizes.remove(&size);
        }
    }
}

/// Best-fit allocator over the offsets of one PE's symmetric heap.
///
/// Allocation is deterministic: the same sequence of `try_malloc`/`free`
/// calls yields the same offsets on every PE, which is what keeps the heap
/// symmetric without exchanging addresses.
#[derive(Debug)]
pub(crate) struct BTreeAlloc {
    free_entries: Mutex<FreeEntries>,
    allocated_addrs: Mutex<BTreeMap<usize, usize>>, //<addr,size>
    start_addr: usize,
    max_size: usize,
    id: String,
}

impl BTreeAlloc {
    pub(crate) fn new(id: String, start_addr: usize, size: usize) -> BTreeAlloc {
        let mut free_entries = FreeEntries::new();
        if size > 0 {
            free_entries.insert(start_addr, size);
        }
        BTreeAlloc {
            free_entries: Mutex::new(free_entries),
            allocated_addrs: Mutex::new(BTreeMap::new()),
            start_addr,
            max_size: size,
            id,
        }
    }

    /// Returns `None` when no free segment is large enough, never blocks.
    pub(crate) fn try_malloc(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let mut free_entries = self.free_entries.lock();
        //find smallest memory segment greater than or equal to size
        let (free_size, addr) = {
            let (free_size, addrs) = free_entries.sizes.range(size..).next()?;
            (*free_size, *addrs.first()?)
        };
        free_entries.remove(addr, free_size);
        if free_size != size {
            free_entries.insert(addr + size, free_size - size);
        }
        drop(free_entries);
        self.allocated_addrs.lock().insert(addr, size);
        Some(addr)
    }

    /// Returns the size that was freed, or `None` if `addr` is not a live allocation.
    pub(crate) fn free(&self, addr: usize) -> Option<usize> {
        let size = self.allocated_addrs.lock().remove(&addr)?;
        let mut temp_addr = addr;
        let mut temp_size = size;
        let mut remove: Vec<(usize, usize)> = vec![];
        let mut free_entries = self.free_entries.lock();
        if let Some((faddr, fsize)) = free_entries.addrs.range(..addr).next_back() {
            //look at address before addr
            if faddr + fsize == addr {
                temp_addr = *faddr;
                temp_size = fsize + size;
                remove.push((*faddr, *fsize));
            }
        }
        if let Some((faddr, fsize)) = free_entries.addrs.range(addr..).next() {
            //look at address after addr
            if temp_addr + temp_size == *faddr {
                temp_size += fsize;
                remove.push((*faddr, *fsize));
            }
        }
        for (raddr, rsize) in remove {
            free_entries.remove(raddr, rsize);
        }
        free_entries.insert(temp_addr, temp_size);
        Some(size)
    }

    pub(crate) fn occupied(&self) -> usize {
        self.allocated_addrs.lock().values().sum()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.start_addr <= addr && addr < self.start_addr + self.max_size
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}
