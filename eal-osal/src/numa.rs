//! NUMA 拓扑探测
//!
//! 读取 `/sys/devices/system/node`；没有 sysfs 时视为单节点 0。

use std::fs;
use std::path::Path;

const NODE_ROOT: &str = "/sys/devices/system/node";

/// 系统中在线的 NUMA 节点，升序
pub fn sockets() -> Vec<u32> {
    let mut nodes = read_nodes(Path::new(NODE_ROOT));
    if nodes.is_empty() {
        nodes.push(0);
    }
    nodes
}

fn read_nodes(root: &Path) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut nodes: Vec<u32> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|id| id.parse().ok())
        })
        .collect();
    nodes.sort_unstable();
    nodes
}

/// 当前线程所在 CPU 的 NUMA 节点
pub fn current_socket() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return socket_of_cpu(cpu as u32);
        }
    }
    0
}

/// CPU 所属的 NUMA 节点；未知时为 0
#[cfg(target_os = "linux")]
fn socket_of_cpu(cpu: u32) -> u32 {
    let dir = format!("/sys/devices/system/cpu/cpu{cpu}");
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .find_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|id| id.parse().ok())
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockets_never_empty() {
        let s = sockets();
        assert!(!s.is_empty());
        assert!(s.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_current_socket_is_known() {
        assert!(sockets().contains(&current_socket()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unknown_cpu_maps_to_node_zero() {
        assert_eq!(socket_of_cpu(u32::MAX), 0);
    }

    #[test]
    fn test_missing_root() {
        assert!(read_nodes(Path::new("/nonexistent/node/root")).is_empty());
    }
}
