//! 平台信息与大页探测

use std::fs;
use std::path::PathBuf;

/// 平台信息
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub total_memory: u64,
    pub page_size: usize,
}

impl PlatformInfo {
    /// 获取当前平台信息
    pub fn get() -> Self {
        Self {
            os: super::host_os().to_string(),
            arch: super::host_arch().to_string(),
            cpu_count: num_cpus::get(),
            total_memory: meminfo_value("MemTotal:").unwrap_or(0),
            page_size: super::system_page_size(),
        }
    }
}

/// 读取 `/proc/meminfo` 中某一项（字节）
fn meminfo_value(key: &str) -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    content
        .lines()
        .find(|l| l.starts_with(key))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

// ============================================================================
// 大页
// ============================================================================

/// 内核支持的大页规格（字节），升序
pub fn hugepage_sizes() -> Vec<usize> {
    let Ok(entries) = fs::read_dir("/sys/kernel/mm/hugepages") else {
        return Vec::new();
    };
    let mut sizes: Vec<usize> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_hugepage_dir(e.file_name().to_str()?))
        .collect();
    sizes.sort_unstable();
    sizes
}

/// 解析 `hugepages-2048kB` 形式的目录名
fn parse_hugepage_dir(name: &str) -> Option<usize> {
    let kb = name.strip_prefix("hugepages-")?.strip_suffix("kB")?;
    kb.parse::<usize>().ok().map(|kb| kb * 1024)
}

/// 某个规格当前空闲的大页数
pub fn free_hugepages(page_size: usize) -> u64 {
    let path = format!(
        "/sys/kernel/mm/hugepages/hugepages-{}kB/free_hugepages",
        page_size / 1024
    );
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// hugetlbfs 挂载点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HugetlbfsMount {
    pub path: PathBuf,
    pub page_size: usize,
}

/// 列出 `/proc/mounts` 中的 hugetlbfs 挂载
///
/// 未指定 `pagesize=` 的挂载使用 `Hugepagesize` 默认值。
pub fn hugetlbfs_mounts() -> Vec<HugetlbfsMount> {
    let Ok(content) = fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };
    let default = meminfo_value("Hugepagesize:").unwrap_or(0) as usize;
    parse_mounts(&content, default)
}

fn parse_mounts(content: &str, default_size: usize) -> Vec<HugetlbfsMount> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _dev = fields.next()?;
            let path = fields.next()?;
            let fstype = fields.next()?;
            let opts = fields.next().unwrap_or("");
            if fstype != "hugetlbfs" {
                return None;
            }
            let page_size = opts
                .split(',')
                .find_map(|o| o.strip_prefix("pagesize="))
                .and_then(parse_size)
                .unwrap_or(default_size);
            Some(HugetlbfsMount {
                path: PathBuf::from(path),
                page_size,
            })
        })
        .collect()
}

/// 解析 `2M` / `1G` / `2048k` 形式的大小
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (num, mul) = match s.char_indices().last()? {
        (i, 'k' | 'K') => (&s[..i], 1usize << 10),
        (i, 'm' | 'M') => (&s[..i], 1 << 20),
        (i, 'g' | 'G') => (&s[..i], 1 << 30),
        _ => (s, 1),
    };
    num.parse::<usize>().ok()?.checked_mul(mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_info() {
        let info = PlatformInfo::get();
        assert!(info.cpu_count > 0);
        assert!(info.page_size >= 4096);
    }

    #[test]
    fn test_parse_hugepage_dir() {
        assert_eq!(parse_hugepage_dir("hugepages-2048kB"), Some(2 << 20));
        assert_eq!(parse_hugepage_dir("hugepages-1048576kB"), Some(1 << 30));
        assert_eq!(parse_hugepage_dir("nr_hugepages"), None);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2M"), Some(2 << 20));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("64k"), Some(64 << 10));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("x"), None);
    }

    #[test]
    fn test_parse_mounts() {
        let mounts = "\
proc /proc proc rw 0 0
nodev /dev/hugepages hugetlbfs rw,relatime,pagesize=2M 0 0
nodev /mnt/huge1g hugetlbfs rw,relatime,pagesize=1024M 0 0
none /mnt/hugedef hugetlbfs rw 0 0
";
        let parsed = parse_mounts(mounts, 2 << 20);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].path, PathBuf::from("/dev/hugepages"));
        assert_eq!(parsed[0].page_size, 2 << 20);
        assert_eq!(parsed[1].page_size, 1 << 30);
        assert_eq!(parsed[2].page_size, 2 << 20);
    }

    #[test]
    fn test_hugepage_sizes_sorted() {
        let sizes = hugepage_sizes();
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }
}
