/// One registered memory region: a symmetric heap address, its length and
/// the device it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XferBenchIov {
    pub addr: usize,
    pub len: usize,
    pub dev_id: usize,
}

impl XferBenchIov {
    pub fn new(addr: usize, len: usize, dev_id: usize) -> XferBenchIov {
        XferBenchIov { addr, len, dev_id }
    }
}

/// The regions one thread transfers, one per device.
pub type IovList = Vec<XferBenchIov>;
/// One [IovList] per transfer issuing thread.
pub type IovLists = Vec<IovList>;

/// Carve every region into `batch_size` consecutive blocks of `block_size`
/// bytes, starting at the region base.
///
/// Local and remote lists built from region lists of the same shape have the
/// same shape themselves, so block `i` of one pairs with block `i` of the other.
/// Regions too small for the whole batch contribute only the blocks that fit.
pub fn make_block_lists(iov_lists: &[IovList], block_size: usize, batch_size: usize) -> IovLists {
    iov_lists
        .iter()
        .map(|iov_list| {
            iov_list
                .iter()
                .flat_map(|iov| {
                    let fits = if block_size == 0 {
                        0
                    } else {
                        (iov.len / block_size).min(batch_size)
                    };
                    (0..fits).map(move |i| {
                        XferBenchIov::new(iov.addr + i * block_size, block_size, iov.dev_id)
                    })
                })
                .collect()
        })
        .collect()
}

/// Total bytes described by a set of lists.
pub fn total_bytes(iov_lists: &[IovList]) -> usize {
    iov_lists
        .iter()
        .flat_map(|list| list.iter())
        .map(|iov| iov.len)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_per_device() {
        let lists = vec![vec![
            XferBenchIov::new(0x1000, 4096, 0),
            XferBenchIov::new(0x9000, 4096, 1),
        ]];
        let blocks = make_block_lists(&lists, 1024, 2);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0],
            vec![
                XferBenchIov::new(0x1000, 1024, 0),
                XferBenchIov::new(0x1400, 1024, 0),
                XferBenchIov::new(0x9000, 1024, 1),
                XferBenchIov::new(0x9400, 1024, 1),
            ]
        );
        assert_eq!(total_bytes(&blocks), 4096);
    }

    #[test]
    fn batch_limited_by_region() {
        let lists = vec![vec![XferBenchIov::new(0, 3000, 0)]];
        let blocks = make_block_lists(&lists, 1024, 8);
        assert_eq!(blocks[0].len(), 2);
        assert!(make_block_lists(&lists, 4096, 1)[0].is_empty());
        assert!(make_block_lists(&lists, 0, 1)[0].is_empty());
    }

    #[test]
    fn shape_is_preserved() {
        let local = vec![vec![XferBenchIov::new(0x100, 8192, 0)], vec![]];
        let remote = vec![vec![XferBenchIov::new(0x200, 8192, 0)], vec![]];
        let l = make_block_lists(&local, 512, 4);
        let r = make_block_lists(&remote, 512, 4);
        assert_eq!(l.len(), r.len());
        for (a, b) in l.iter().zip(r.iter()) {
            assert_eq!(a.len(), b.len());
        }
    }
}
