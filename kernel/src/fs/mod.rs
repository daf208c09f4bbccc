//! File systems: the byte-granular block cache and the EXT2 driver.

pub mod blockcache;
pub mod ext2;
