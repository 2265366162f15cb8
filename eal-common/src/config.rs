//! 统一配置管理
//!
//! 提供 `Config` Trait 以及内存核心使用的进程本地配置 [`MemoryConfig`]。
//! 命令行与环境变量解析不在本 crate 范围内，调用方负责填充配置。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::MAX_NUMA_NODES;

/// 统一配置 Trait
///
/// # 示例
///
/// ```rust,ignore
/// use eal_common::config::{Config, MemoryConfig};
///
/// let cfg = MemoryConfig::from_toml("legacy_mem = true")?;
/// cfg.validate()?;
/// ```
pub trait Config: Serialize + serde::de::DeserializeOwned {
    /// 验证配置的有效性
    ///
    /// # 错误
    ///
    /// 如果配置无效，返回 `ConfigError::Invalid`
    fn validate(&self) -> Result<(), ConfigError>;

    /// 获取默认配置
    fn defaults() -> Self;

    /// 合并两个配置
    ///
    /// `self` 为基础配置，`other` 优先级更高
    ///
    /// # 错误
    ///
    /// 如果配置冲突无法合并，返回 `ConfigError::MergeConflict`
    fn merge(&self, other: &Self) -> Result<Self, ConfigError>
    where
        Self: Sized;

    /// 从 TOML 字符串加载配置
    fn from_toml(toml: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// 从 JSON 字符串加载配置
    fn from_json(json: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {}", e)))
    }

    /// 将配置序列化为 TOML
    fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// 将配置序列化为 JSON
    fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("JSON serialize error: {}", e)))
    }

    /// 从环境变量加载配置
    fn from_env(_prefix: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        Err(ConfigError::NotSupported(
            "Environment variable loading not implemented for this config type".to_string(),
        ))
    }
}

/// 配置错误类型
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// 无效的配置
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// 配置合并冲突
    #[error("Configuration merge conflict: {0}")]
    MergeConflict(String),

    /// 解析错误
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// 序列化错误
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 不支持的操作
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

// ============================================================================
// 内存配置
// ============================================================================

/// 进程角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    /// 能独占创建共享配置则为主进程，否则为从进程
    Auto,
    #[default]
    Primary,
    Secondary,
}

/// 设备可见地址（IOVA）的取值方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IovaMode {
    /// IOVA 等于虚拟地址
    #[default]
    Va,
    /// IOVA 等于物理地址（需要读取 pagemap 的权限）
    Pa,
}

/// 某个大页规格对应的 hugetlbfs 目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugepageDir {
    pub page_size: usize,
    pub dir: PathBuf,
}

/// 内存核心的进程本地配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 初始化时预留的总字节数（不区分节点）；0 表示不预留
    pub memory: usize,
    /// 覆盖探测到的内存通道数；0 表示未指定
    pub force_nchannel: u32,
    /// 覆盖探测到的内存 rank 数；0 表示未指定
    pub force_nrank: u32,
    /// 按节点预留的字节数，下标为节点号
    pub socket_mem: Vec<usize>,
    /// 按节点的使用上限，0 表示不限
    pub socket_limit: Vec<usize>,
    /// 旧式内存模型：初始化时全部预分配，之后不增长也不释放
    pub legacy_mem: bool,
    /// 每个段列表只用一个后备文件
    pub single_file_segments: bool,
    /// 不使用 hugetlbfs，以匿名内存模拟大页
    pub no_hugetlbfs: bool,
    /// 映射后立即删除大页文件
    pub hugepage_unlink: bool,
    /// 不创建任何文件系统对象（隐含 `no_shconf` 与 `hugepage_unlink`）
    pub in_memory: bool,
    /// 不创建共享配置文件
    pub no_shconf: bool,
    /// 释放时按分配时的粒度整块归还页
    pub match_allocations: bool,
    /// hugetlbfs 目录；为空时从 `/proc/mounts` 探测
    pub hugepage_dirs: Vec<HugepageDir>,
    /// `no_hugetlbfs` 模式下模拟的页规格
    pub no_huge_page_sizes: Vec<usize>,
    /// 大页文件名前缀
    pub hugefile_prefix: String,
    /// 运行时目录（共享配置文件所在处）；`None` 时使用系统临时目录
    pub runtime_dir: Option<PathBuf>,
    pub process_type: ProcessType,
    pub iova_mode: IovaMode,
    /// 最大 SIMD 位宽；0 表示未指定
    pub max_simd_bitwidth: u16,
    /// 地址空间预留的起始提示；0 表示由内核挑选
    pub base_virtaddr: usize,
    /// 每个段列表的槽位数
    pub segs_per_list: usize,
    /// 使用的 NUMA 节点；为空时自动探测
    pub numa_sockets: Vec<u32>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory: 0,
            force_nchannel: 0,
            force_nrank: 0,
            socket_mem: Vec::new(),
            socket_limit: Vec::new(),
            legacy_mem: false,
            single_file_segments: false,
            no_hugetlbfs: false,
            hugepage_unlink: false,
            in_memory: false,
            no_shconf: false,
            match_allocations: false,
            hugepage_dirs: Vec::new(),
            no_huge_page_sizes: vec![2 * 1024 * 1024],
            hugefile_prefix: "rtemap".to_string(),
            runtime_dir: None,
            process_type: ProcessType::Primary,
            iova_mode: IovaMode::Va,
            max_simd_bitwidth: 0,
            base_virtaddr: 0,
            segs_per_list: 1024,
            numa_sockets: Vec::new(),
        }
    }
}

impl MemoryConfig {
    /// 是否使用共享配置文件
    pub fn uses_shared_file(&self) -> bool {
        !(self.in_memory || self.no_shconf)
    }

    /// 大页文件映射后是否删除
    pub fn unlink_hugepages(&self) -> bool {
        self.hugepage_unlink || self.in_memory
    }

    /// 运行时目录
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("eal"))
    }

    /// 共享配置文件路径
    pub fn config_file_path(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.config", self.hugefile_prefix))
    }

    /// 某节点的初始预留量
    pub fn socket_mem_for(&self, socket: u32) -> usize {
        self.socket_mem.get(socket as usize).copied().unwrap_or(0)
    }

    /// 某节点的使用上限；0 表示不限
    pub fn socket_limit_for(&self, socket: u32) -> usize {
        self.socket_limit.get(socket as usize).copied().unwrap_or(0)
    }

    /// 某个页规格对应的 hugetlbfs 目录
    pub fn hugepage_dir_for(&self, page_size: usize) -> Option<&Path> {
        self.hugepage_dirs
            .iter()
            .find(|d| d.page_size == page_size)
            .map(|d| d.dir.as_path())
    }
}

impl Config for MemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.memory != 0 && !self.socket_mem.is_empty() {
            return invalid("memory and socket_mem are mutually exclusive");
        }
        if self.legacy_mem && self.single_file_segments {
            return invalid("legacy_mem is not compatible with single_file_segments");
        }
        if self.legacy_mem && self.socket_limit.iter().any(|&l| l != 0) {
            return invalid("socket_limit is not supported in legacy_mem mode");
        }
        if self.no_hugetlbfs && !self.socket_mem.is_empty() {
            return invalid("socket_mem cannot be combined with no_hugetlbfs");
        }
        if self.process_type == ProcessType::Secondary && !self.uses_shared_file() {
            return invalid("a secondary process requires a shared config file");
        }
        if self.force_nchannel > 32 {
            return invalid("force_nchannel must be <= 32");
        }
        if self.force_nrank > 16 {
            return invalid("force_nrank must be <= 16");
        }
        if self.max_simd_bitwidth != 0
            && (!self.max_simd_bitwidth.is_power_of_two() || self.max_simd_bitwidth < 64)
        {
            return invalid("max_simd_bitwidth must be a power of two >= 64");
        }
        if self.socket_mem.len() > MAX_NUMA_NODES || self.socket_limit.len() > MAX_NUMA_NODES {
            return invalid("per-socket vectors exceed the NUMA node limit");
        }
        if let Some(s) = self
            .numa_sockets
            .iter()
            .find(|&&s| s as usize >= MAX_NUMA_NODES)
        {
            return Err(ConfigError::Invalid(format!(
                "numa socket {s} exceeds the NUMA node limit"
            )));
        }
        if self.segs_per_list == 0 {
            return invalid("segs_per_list must be > 0");
        }
        if self
            .hugepage_dirs
            .iter()
            .map(|d| d.page_size)
            .chain(self.no_huge_page_sizes.iter().copied())
            .any(|sz| !sz.is_power_of_two())
        {
            return invalid("page sizes must be powers of two");
        }
        if self.no_hugetlbfs && self.no_huge_page_sizes.is_empty() {
            return invalid("no_hugetlbfs needs at least one emulated page size");
        }
        if self.hugefile_prefix.is_empty() || self.hugefile_prefix.contains('/') {
            return invalid("hugefile_prefix must be a non-empty file name");
        }
        Ok(())
    }

    fn defaults() -> Self {
        Self::default()
    }

    /// `other` 中非默认值的字段覆盖 `self`
    fn merge(&self, other: &Self) -> Result<Self, ConfigError> {
        let def = Self::default();
        let mut out = self.clone();

        macro_rules! pick {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field != def.$field {
                        out.$field = other.$field.clone();
                    }
                )*
            };
        }

        pick!(
            memory,
            force_nchannel,
            force_nrank,
            socket_mem,
            socket_limit,
            legacy_mem,
            single_file_segments,
            no_hugetlbfs,
            hugepage_unlink,
            in_memory,
            no_shconf,
            match_allocations,
            hugepage_dirs,
            no_huge_page_sizes,
            hugefile_prefix,
            runtime_dir,
            process_type,
            iova_mode,
            max_simd_bitwidth,
            base_virtaddr,
            segs_per_list,
            numa_sockets,
        );

        if out.memory != 0 && !out.socket_mem.is_empty() {
            return Err(ConfigError::MergeConflict(
                "memory and socket_mem both set after merge".to_string(),
            ));
        }
        Ok(out)
    }
}

// ============================================================================
// 配置构建器
// ============================================================================

/// 配置构建器
///
/// ```rust,ignore
/// let config = ConfigBuilder::<MemoryConfig>::with_defaults()
///     .with_file(Path::new("eal.toml"))?
///     .with_override(cli_config)
///     .build()?;
/// ```
pub struct ConfigBuilder<C: Config> {
    base: C,
    overrides: Vec<C>,
}

impl<C: Config> ConfigBuilder<C> {
    /// 使用默认配置
    pub fn with_defaults() -> Self {
        Self {
            base: C::defaults(),
            overrides: Vec::new(),
        }
    }

    /// 从 TOML 文件加载配置
    pub fn with_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        self.overrides.push(C::from_toml(&content)?);
        Ok(self)
    }

    /// 从环境变量加载配置
    pub fn with_env(mut self, prefix: &str) -> Result<Self, ConfigError> {
        self.overrides.push(C::from_env(prefix)?);
        Ok(self)
    }

    /// 添加配置覆盖
    pub fn with_override(mut self, config: C) -> Self {
        self.overrides.push(config);
        self
    }

    /// 按优先级合并所有配置并验证：base < file < env < overrides
    pub fn build(mut self) -> Result<C, ConfigError> {
        let mut current = self.base;
        for override_config in self.overrides.drain(..) {
            current = current.merge(&override_config)?;
        }
        current.validate()?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = MemoryConfig::defaults();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.segs_per_list, 1024);
        assert_eq!(cfg.process_type, ProcessType::Primary);
        assert!(cfg.uses_shared_file());
    }

    #[test]
    fn test_validate_rejects_conflicts() {
        let cfg = MemoryConfig {
            memory: 1 << 30,
            socket_mem: vec![1 << 30],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = MemoryConfig {
            legacy_mem: true,
            single_file_segments: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MemoryConfig {
            legacy_mem: true,
            socket_limit: vec![1 << 20],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MemoryConfig {
            process_type: ProcessType::Secondary,
            in_memory: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MemoryConfig {
            max_simd_bitwidth: 96,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MemoryConfig {
            segs_per_list: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_in_memory_implies_unlink_and_no_file() {
        let cfg = MemoryConfig {
            in_memory: true,
            ..Default::default()
        };
        assert!(!cfg.uses_shared_file());
        assert!(cfg.unlink_hugepages());
    }

    #[test]
    fn test_from_toml() {
        let cfg = MemoryConfig::from_toml(
            r#"
            legacy_mem = true
            socket_mem = [4194304, 0]
            process_type = "auto"
            iova_mode = "pa"

            [[hugepage_dirs]]
            page_size = 2097152
            dir = "/dev/hugepages"
            "#,
        )
        .unwrap();
        assert!(cfg.legacy_mem);
        assert_eq!(cfg.socket_mem_for(0), 4 << 20);
        assert_eq!(cfg.socket_mem_for(5), 0);
        assert_eq!(cfg.process_type, ProcessType::Auto);
        assert_eq!(cfg.iova_mode, IovaMode::Pa);
        assert_eq!(
            cfg.hugepage_dir_for(2 << 20),
            Some(Path::new("/dev/hugepages"))
        );
        // 未写出的字段取默认值
        assert_eq!(cfg.segs_per_list, 1024);
    }

    #[test]
    fn test_json_roundtrip_preserves_fields() {
        let cfg = MemoryConfig {
            match_allocations: true,
            numa_sockets: vec![0, 1],
            ..Default::default()
        };
        let json = cfg.to_json().unwrap();
        assert_eq!(MemoryConfig::from_json(&json).unwrap(), cfg);
    }

    #[test]
    fn test_merge_prefers_non_default_override() {
        let base = MemoryConfig {
            memory: 64 << 20,
            hugefile_prefix: "base".into(),
            ..Default::default()
        };
        let over = MemoryConfig {
            legacy_mem: true,
            ..Default::default()
        };
        let merged = base.merge(&over).unwrap();
        assert_eq!(merged.memory, 64 << 20);
        assert_eq!(merged.hugefile_prefix, "base");
        assert!(merged.legacy_mem);

        let conflicting = MemoryConfig {
            socket_mem: vec![1 << 20],
            ..Default::default()
        };
        assert!(matches!(
            base.merge(&conflicting),
            Err(ConfigError::MergeConflict(_))
        ));
    }

    #[test]
    fn test_builder_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eal.toml");
        std::fs::write(&path, "no_hugetlbfs = true\nsegs_per_list = 64\n").unwrap();
        let cfg = ConfigBuilder::<MemoryConfig>::with_defaults()
            .with_file(&path)
            .unwrap()
            .with_override(MemoryConfig {
                no_shconf: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        assert!(cfg.no_hugetlbfs);
        assert!(cfg.no_shconf);
        assert_eq!(cfg.segs_per_list, 64);
    }

    #[test]
    fn test_builder_env_not_supported() {
        let r = ConfigBuilder::<MemoryConfig>::with_defaults().with_env("EAL");
        assert!(matches!(r, Err(ConfigError::NotSupported(_))));
    }
}
