//! Region set behaviour under arbitrary insert sequences

use createdump_core::regions::{MemoryRegion, Permissions, RegionSet};

const PAGE: u64 = 0x1000;

/// Small deterministic generator so failures reproduce
struct Lcg(u64);

impl Lcg
{
    fn next(&mut self) -> u64
    {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn spans(set: &RegionSet) -> Vec<(u64, u64)>
{
    set.iter().map(|region| (region.start, region.end)).collect()
}

fn assert_well_formed(set: &RegionSet)
{
    let mut previous_end = 0;
    for region in set.iter() {
        assert!(region.start < region.end, "empty region {region}");
        assert_eq!(region.start % PAGE, 0, "unaligned start {region}");
        assert_eq!(region.end % PAGE, 0, "unaligned end {region}");
        assert!(region.start >= previous_end, "overlap at {region}");
        previous_end = region.end;
    }
}

#[test]
fn test_random_inserts_stay_disjoint_and_aligned()
{
    for seed in 1..=32 {
        let mut rng = Lcg(seed);
        let mut set = RegionSet::new(PAGE);
        let mut inserted = Vec::new();

        for _ in 0..200 {
            let address = rng.next() % 0x40_0000;
            let size = rng.next() % 0x8000;
            set.insert(address, size);
            if size > 0 {
                inserted.push(address);
            }
        }

        assert_well_formed(&set);
        for address in inserted {
            assert!(set.find(address).is_some(), "seed {seed}: lost 0x{address:x}");
        }
    }
}

#[test]
fn test_coalesce_is_idempotent()
{
    let mut rng = Lcg(7);
    let mut set = RegionSet::new(PAGE);
    for _ in 0..100 {
        set.insert(rng.next() % 0x10_0000, rng.next() % 0x3000);
    }
    let before = set.total_size();

    set.coalesce();
    let once = spans(&set);
    set.coalesce();

    assert_eq!(spans(&set), once);
    assert_eq!(set.total_size(), before);
    assert_well_formed(&set);
    assert!(once.windows(2).all(|pair| pair[0].1 < pair[1].0), "adjacent read-only runs merged");
}

#[test]
fn test_adjacent_ranges_coalesce()
{
    let mut set = RegionSet::new(PAGE);
    set.insert(0x1000, 0x1000);
    set.insert(0x2000, 0x1000);
    set.coalesce();
    assert_eq!(spans(&set), vec![(0x1000, 0x3000)]);
}

#[test]
fn test_contained_insert_changes_nothing()
{
    let mut set = RegionSet::new(PAGE);
    set.insert(0x1000, 0x2000);
    set.insert(0x1000, 0x1000);
    assert_eq!(spans(&set), vec![(0x1000, 0x3000)]);

    set.insert(0x1800, 0x10);
    assert_eq!(spans(&set), vec![(0x1000, 0x3000)]);
}

#[test]
fn test_first_inserter_keeps_contested_pages()
{
    let rx = Permissions::from_maps_letters("r-xp");
    let rw = Permissions::from_maps_letters("rw-p");
    let mut set = RegionSet::new(PAGE);

    set.insert_region(MemoryRegion::new(0x10000, 0x14000, rx).with_file("/lib/libc.so.6", 0), |_| true);
    let added = set.insert_region(MemoryRegion::new(0x12000, 0x18000, rw), |_| true);

    assert_eq!(added, 0x4000);
    assert_well_formed(&set);
    assert_eq!(set.find(0x13000).map(|region| region.permissions), Some(rx));
    assert_eq!(set.find(0x15000).map(|region| region.permissions), Some(rw));

    set.coalesce();
    assert_eq!(spans(&set), vec![(0x10000, 0x14000), (0x14000, 0x18000)]);
}

#[test]
fn test_unreadable_pages_are_dropped()
{
    let mut set = RegionSet::new(PAGE);
    let added = set.insert_region(MemoryRegion::new(0x1000, 0x5000, Permissions::READ_ONLY), |page| {
        page != 0x3000
    });
    assert_eq!(added, 0x3000);
    assert!(set.find(0x3000).is_none());
    assert_well_formed(&set);
}
