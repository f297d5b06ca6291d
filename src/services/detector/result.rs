use crate::classification::{PatternRule, Scope};
use crate::error::{Result, ScopeError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Приоритет правил, предложенных по результату детекции
pub const SUGGESTED_RULE_PRIORITY: u32 = 100;

pub const ISOLATED_CONFIDENCE: f32 = 1.0;
pub const DESKTOP_CONFIDENCE: f32 = 0.9;
pub const HEURISTIC_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    IsolatedDisplay,
    DesktopMetadata,
    Heuristic,
    Failed,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionMethod::IsolatedDisplay => "isolated_display",
            DetectionMethod::DesktopMetadata => "desktop_metadata",
            DetectionMethod::Heuristic => "heuristic",
            DetectionMethod::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Результат одной попытки детекции. Не изменяется после создания.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionResult {
    pub source_identifier: String,
    pub detected_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_instance: Option<String>,
    pub method: DetectionMethod,
    pub confidence: f32,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionResult {
    fn success(
        source: impl Into<String>,
        class: impl Into<String>,
        instance: Option<String>,
        method: DetectionMethod,
        confidence: f32,
    ) -> Self {
        Self {
            source_identifier: source.into(),
            detected_class: Some(class.into()),
            detected_instance: instance,
            method,
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn isolated(source: impl Into<String>, class: impl Into<String>, instance: Option<String>) -> Self {
        Self::success(source, class, instance, DetectionMethod::IsolatedDisplay, ISOLATED_CONFIDENCE)
    }

    pub fn desktop(source: impl Into<String>, class: impl Into<String>) -> Self {
        Self::success(source, class, None, DetectionMethod::DesktopMetadata, DESKTOP_CONFIDENCE)
    }

    pub fn heuristic(source: impl Into<String>, class: impl Into<String>) -> Self {
        Self::success(source, class, None, DetectionMethod::Heuristic, HEURISTIC_CONFIDENCE)
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_identifier: source.into(),
            detected_class: None,
            detected_instance: None,
            method: DetectionMethod::Failed,
            confidence: 0.0,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.method == DetectionMethod::Failed
    }

    /// В кэш попадают только наблюдённые классы. Эвристика по имени
    /// команды пересчитывается, как только появится Xvfb.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.method,
            DetectionMethod::IsolatedDisplay | DetectionMethod::DesktopMetadata
        )
    }

    /// Failed требует текста ошибки, остальные методы требуют класс и запрещают ошибку
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(ScopeError::config(
                format!("detection[{}]", self.source_identifier),
                message.to_string(),
            ))
        };

        if !(0.0..=1.0).contains(&self.confidence) {
            return invalid("confidence вне диапазона [0, 1]");
        }

        match self.method {
            DetectionMethod::Failed => {
                if self.error.as_deref().map_or(true, str::is_empty) {
                    return invalid("для method=failed нужен текст ошибки");
                }
            }
            _ => {
                if self.detected_class.as_deref().map_or(true, str::is_empty) {
                    return invalid("не указан detected_class");
                }
                if self.error.is_some() {
                    return invalid("ошибка допустима только при method=failed");
                }
            }
        }
        Ok(())
    }

    pub fn is_stale(&self, ttl: ChronoDuration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) > ttl
    }

    /// Литеральное правило для найденного класса
    pub fn suggested_rule(&self, scope: Scope) -> Option<PatternRule> {
        let class = self.detected_class.as_deref().filter(|c| !c.is_empty())?;
        if self.is_failed() {
            return None;
        }
        PatternRule::new(class, scope, SUGGESTED_RULE_PRIORITY)
            .ok()
            .map(|rule| {
                rule.with_description(format!(
                    "обнаружено для '{}' ({})",
                    self.source_identifier, self.method
                ))
            })
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detected_class, &self.error) {
            (Some(class), _) => write!(
                f,
                "{} -> {} ({}, {:.2})",
                self.source_identifier, class, self.method, self.confidence
            ),
            (None, Some(error)) => write!(f, "{} -> не определено: {}", self.source_identifier, error),
            (None, None) => write!(f, "{} -> не определено", self.source_identifier),
        }
    }
}
