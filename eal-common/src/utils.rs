//! 通用工具函数
//!
//! 地址与长度都以 `usize` 表示。

/// 向上对齐到指定对齐边界
///
/// # 参数
/// - `value`: 要对齐的值
/// - `alignment`: 对齐边界（必须是2的幂）
///
/// # 示例
/// ```
/// assert_eq!(eal_common::utils::align_up(5, 8), 8);
/// assert_eq!(eal_common::utils::align_up(17, 8), 24);
/// ```
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// 溢出时返回 `None` 的 [`align_up`]
#[inline]
pub const fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// 向下对齐到指定对齐边界
///
/// # 示例
/// ```
/// assert_eq!(eal_common::utils::align_down(17, 8), 16);
/// ```
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// 检查值是否对齐到指定边界
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// 检查是否是2的幂
#[inline]
pub const fn is_power_of_two(value: usize) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

/// 向上取整的 log2；`value` 为 0 或 1 时返回 0
#[inline]
pub const fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

/// `[addr, addr + len)` 是否跨越 `bound` 对齐边界；`bound` 为 0 表示无边界
#[inline]
pub const fn crosses_boundary(addr: usize, len: usize, bound: usize) -> bool {
    if bound == 0 || len == 0 {
        return false;
    }
    align_down(addr, bound) != align_down(addr + len - 1, bound)
}

/// 将字节数格式化为人类可读的形式
///
/// # 返回
/// 格式化后的字符串（如 "1.50 KB", "23.0 MB"）
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else if size < 10.0 {
        format!("{:.2} {}", size, UNITS[unit_index])
    } else if size < 100.0 {
        format!("{:.1} {}", size, UNITS[unit_index])
    } else {
        format!("{:.0} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(5, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4095, 4096), 4096);
        assert_eq!(checked_align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, 8), 0);
        assert_eq!(align_down(7, 8), 0);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(256), 8);
        assert_eq!(ceil_log2(257), 9);
    }

    #[test]
    fn test_crosses_boundary() {
        assert!(!crosses_boundary(0, 4096, 4096));
        assert!(crosses_boundary(4000, 200, 4096));
        assert!(!crosses_boundary(4000, 200, 0));
        assert!(!crosses_boundary(4096, 4096, 4096));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.0 MB");
        assert_eq!(format_bytes(512 * 1024 * 1024), "512 MB");
    }

    proptest! {
        #[test]
        fn prop_align_up_is_smallest_multiple(v in 0usize..1 << 40, shift in 0u32..30) {
            let a = 1usize << shift;
            let r = align_up(v, a);
            prop_assert!(is_aligned(r, a));
            prop_assert!(r >= v);
            prop_assert!(r - v < a);
        }
    }
}
