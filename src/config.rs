use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classification::Scope;
use crate::resolver::TitleRule;
use crate::utils::paths;

/// Настройки демона и CLI (не путать с файлом классификации)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub logging: LoggingConfig,
    pub classification: ClassificationSettings,
    pub ipc: IpcConfig,
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TitleRuleConfig {
    pub class: String,
    pub title_pattern: String,
    /// Регулярное выражение для WM_WINDOW_ROLE, проверяется после заголовка
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_pattern: Option<String>,
}

impl TitleRuleConfig {
    pub fn build(&self) -> crate::error::Result<TitleRule> {
        let rule = TitleRule::new(self.class.clone(), &self.title_pattern)?;
        match &self.role_pattern {
            Some(role) => rule.with_role(role),
            None => Ok(rule),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationSettings {
    pub path: PathBuf,
    pub registry_path: PathBuf,
    /// Политика ClassificationStore::is_scoped для неизвестных классов
    pub unclassified_policy: Scope,
    /// Что демон делает с окном, которое не удалось классифицировать
    pub default_action: Scope,
    pub shared_process_classes: Vec<String>,
    pub title_rules: Vec<TitleRuleConfig>,
    pub match_cache_capacity: usize,
    pub active_project_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Сколько ждать ответа на запрос, прежде чем считать соединение мёртвым
    pub request_timeout_ms: u64,
    pub reload_tick: String,
    pub detect_tick_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    pub xvfb_binary: String,
    pub probe_binary: String,
    pub xprop_binary: String,
    pub display_base: u32,
    pub display_pool_size: u32,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub grace_ms: u64,
    pub ready_timeout_ms: u64,
    pub max_concurrent: usize,
    pub cache_path: PathBuf,
    pub cache_ttl_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "compact".to_string(),
            },
            classification: ClassificationSettings {
                path: paths::config_dir().join("window-classes.json"),
                registry_path: paths::config_dir().join("applications.json"),
                unclassified_policy: Scope::Scoped,
                default_action: Scope::Global,
                shared_process_classes: Vec::new(),
                title_rules: Vec::new(),
                match_cache_capacity: 1024,
                active_project_path: paths::config_dir().join("active-project"),
            },
            ipc: IpcConfig {
                socket_path: None,
                reconnect_initial_ms: 1000,
                reconnect_max_ms: 30_000,
                request_timeout_ms: 10_000,
                reload_tick: "scopewm:reload".to_string(),
                detect_tick_prefix: "scopewm:detect ".to_string(),
            },
            detection: DetectionConfig {
                xvfb_binary: "Xvfb".to_string(),
                probe_binary: "xdotool".to_string(),
                xprop_binary: "xprop".to_string(),
                display_base: 99,
                display_pool_size: 8,
                timeout_ms: 10_000,
                poll_interval_ms: 200,
                grace_ms: 1000,
                ready_timeout_ms: 1000,
                max_concurrent: 3,
                cache_path: paths::cache_dir().join("detections.json"),
                cache_ttl_days: 30,
            },
        }
    }
}

impl Config {
    /// Значения по умолчанию <- TOML-файл <- переменные окружения `SCOPEWM_`
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SCOPEWM_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Не удалось загрузить конфигурацию из {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Валидация настроек логирования
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Неверный уровень логирования: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Неверный формат логирования: {}", self.logging.format),
        }

        if self.classification.match_cache_capacity == 0 {
            anyhow::bail!("match_cache_capacity должно быть больше 0");
        }

        for rule in &self.classification.title_rules {
            rule.build()
                .with_context(|| format!("Неверное правило заголовка для класса '{}'", rule.class))?;
        }

        // Валидация переподключения
        if self.ipc.reconnect_initial_ms == 0 {
            anyhow::bail!("reconnect_initial_ms должно быть больше 0");
        }
        if self.ipc.reconnect_max_ms < self.ipc.reconnect_initial_ms {
            anyhow::bail!("reconnect_max_ms должно быть не меньше reconnect_initial_ms");
        }
        if self.ipc.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms должно быть больше 0");
        }
        if self.ipc.reload_tick.trim().is_empty() {
            anyhow::bail!("reload_tick не может быть пустым");
        }

        // Валидация детекции
        let d = &self.detection;
        if d.poll_interval_ms == 0 || d.timeout_ms == 0 || d.ready_timeout_ms == 0 {
            anyhow::bail!("Интервалы и таймауты детекции должны быть больше 0");
        }
        if d.poll_interval_ms > d.timeout_ms {
            anyhow::bail!("poll_interval_ms должно быть меньше timeout_ms");
        }
        if d.max_concurrent == 0 {
            anyhow::bail!("max_concurrent должно быть больше 0");
        }
        if (d.display_pool_size as usize) < d.max_concurrent {
            anyhow::bail!(
                "display_pool_size ({}) меньше max_concurrent ({})",
                d.display_pool_size,
                d.max_concurrent
            );
        }
        if d.cache_ttl_days == 0 {
            anyhow::bail!("cache_ttl_days должно быть больше 0");
        }

        Ok(())
    }

    pub fn title_rules(&self) -> crate::error::Result<Vec<TitleRule>> {
        self.classification
            .title_rules
            .iter()
            .map(TitleRuleConfig::build)
            .collect()
    }
}

impl IpcConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}
