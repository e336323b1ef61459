//! 分块规划 - 纯函数，无状态

use std::ops::Range;

/// 计算分块总数，空文件为 0
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    assert!(chunk_size > 0, "chunk_size must be positive");
    file_size.div_ceil(chunk_size)
}

/// 第 index 块的字节区间 `[i*cs, min((i+1)*cs, file_size))`
pub fn chunk_range(index: u64, file_size: u64, chunk_size: u64) -> Range<u64> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let start = index * chunk_size;
    let end = std::cmp::min(start + chunk_size, file_size);
    start..end
}
