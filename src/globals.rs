/// Size of a chunk. Must be a multiple of the platform superpage size.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;
/// Base-two logarithm of `CHUNK_SIZE`.
pub const CHUNK_BITS: usize = 21;
/// Smallest granularity at which page-table operations work.
pub const PAGE_SIZE: usize = 4096;
/// Stride unit for medium size classes. Does not have to be accurate.
pub const CACHE_LINE_SIZE: usize = 64;
/// Number of valid non-zero bits expected in a virtual address.
pub const ADDRESS_SPACE_BITS: usize = 48;
/// Allocation granularity; also the width of a scanned slot.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
/// Requests above this go straight to the OS, one mapping per allocation.
pub const HUGE_THRESHOLD: usize = CHUNK_SIZE / 4;
/// Number of allocations materialized per iterator refill.
pub const ITER_BATCH: usize = 64;
