//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_ITERATIONS=40`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub llm: LlmSection,
    pub store: StoreSection,
}

/// [engine] 段：迭代预算、历史窗口、重试与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 任务未指定 max_iterations 时使用
    pub max_iterations: usize,
    /// DecisionContext 中携带的最近迭代数
    pub history_window: usize,
    pub max_consecutive_failures: u32,
    pub max_timeout_retries: u32,
    /// 推理端单轮最多尝试次数
    pub reasoning_max_attempts: u32,
    /// 推理端重试的初始退避（毫秒，按 2 的幂增长）
    pub reasoning_backoff_ms: u64,
    pub event_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            history_window: 8,
            max_consecutive_failures: 3,
            max_timeout_retries: 1,
            reasoning_max_attempts: 3,
            reasoning_backoff_ms: 500,
            event_buffer: 256,
        }
    }
}

impl EngineSection {
    pub fn reasoning_backoff(&self) -> Duration {
        Duration::from_millis(self.reasoning_backoff_ms)
    }
}

/// [tools] 段：默认超时、按工具覆盖的超时、Shell 白名单、HTTP 域名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 工具名 -> 超时（秒）
    pub timeouts: HashMap<String, u64>,
    pub shell: ShellSection,
    pub http: HttpSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            timeouts: HashMap::new(),
            shell: ShellSection::default(),
            http: HttpSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "date"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// [tools.http] 段：抓取 URL 的超时、最大字符数、允许的域名白名单（含子域名）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: [
                "wikipedia.org",
                "github.com",
                "raw.githubusercontent.com",
                "docs.rs",
                "crates.io",
                "doc.rust-lang.org",
                "developer.mozilla.org",
                "arxiv.org",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// [store] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("hive.db"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_iterations, 20);
        assert_eq!(cfg.engine.history_window, 8);
        assert_eq!(cfg.engine.reasoning_backoff(), Duration::from_millis(500));
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.store.backend, "memory");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_iterations = 5\n\n[tools.timeouts]\nslow = 90\n\n[llm]\nprovider = \"mock\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_iterations, 5);
        assert_eq!(cfg.engine.max_consecutive_failures, 3);
        assert_eq!(cfg.tools.timeouts.get("slow"), Some(&90));
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.llm.request_timeout_secs, 60);
    }
}
