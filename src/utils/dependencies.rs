use crate::config::DetectionConfig;
use crate::error::{Result, ScopeError};
use tracing::{info, warn};

use super::paths::find_executable;

/// Состояние внешних утилит, нужных для изолированной детекции
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReport {
    pub missing: Vec<String>,
}

impl DependencyReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(ScopeError::DependencyMissing(format!(
            "не найдены: {}. Установите пакеты xorg-server-xvfb, xdotool, xprop",
            self.missing.join(", ")
        )))
    }
}

/// Проверить наличие Xvfb и утилит запроса свойств окон
pub fn check_detection_dependencies(config: &DetectionConfig) -> DependencyReport {
    let missing: Vec<String> = [
        config.xvfb_binary.as_str(),
        config.probe_binary.as_str(),
        config.xprop_binary.as_str(),
    ]
    .iter()
    .filter(|binary| find_executable(binary).is_none())
    .map(|binary| binary.to_string())
    .collect();

    if missing.is_empty() {
        info!("Все зависимости изолированной детекции найдены");
    } else {
        warn!("Отсутствуют зависимости детекции: {}", missing.join(", "));
    }

    DependencyReport { missing }
}
