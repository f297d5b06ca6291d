use crate::classification::Scope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Итоговая область окна после разрешения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedScope {
    Scoped,
    Global,
    Unclassified,
}

impl From<Scope> for ResolvedScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Scoped => ResolvedScope::Scoped,
            Scope::Global => ResolvedScope::Global,
        }
    }
}

impl fmt::Display for ResolvedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedScope::Scoped => write!(f, "scoped"),
            ResolvedScope::Global => write!(f, "global"),
            ResolvedScope::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Какой уровень принял решение
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    ExplicitList,
    EnvironmentTarget,
    Pattern,
    Heuristic,
    Unknown,
}

/// Результат разрешения области для окна
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub scope: ResolvedScope,
    pub source: ResolutionSource,
    pub confidence: f32,
    pub project: Option<String>,
    pub target_workspace: Option<String>,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            scope: ResolvedScope::Unclassified,
            source: ResolutionSource::Unknown,
            confidence: 0.0,
            project: None,
            target_workspace: None,
        }
    }
}

impl Resolution {
    pub fn new(scope: impl Into<ResolvedScope>, source: ResolutionSource, confidence: f32) -> Self {
        Self {
            scope: scope.into(),
            source,
            confidence: confidence.clamp(0.0, 1.0),
            project: None,
            target_workspace: None,
        }
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    pub fn with_target_workspace(mut self, workspace: Option<String>) -> Self {
        self.target_workspace = workspace;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.scope != ResolvedScope::Unclassified
    }
}

/// Информация об окне, собранная из события или дерева оконного менеджера.
/// Живёт ровно один шаг обработки.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowIdentity {
    pub window_id: u64,
    pub window_class: Option<String>,
    pub instance: Option<String>,
    pub window_role: Option<String>,
    pub title: String,
    pub pid: Option<u32>,
    pub marks: BTreeSet<String>,
    pub workspace: String,
    #[serde(default)]
    pub resolution: Resolution,
}

impl WindowIdentity {
    pub fn new(window_id: u64, title: String) -> Self {
        Self {
            window_id,
            window_class: None,
            instance: None,
            window_role: None,
            title,
            pid: None,
            marks: BTreeSet::new(),
            workspace: String::new(),
            resolution: Resolution::default(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.window_class = Some(class.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.marks.insert(mark.into());
        self
    }

    /// Класс или instance, если класса нет (нативные wayland-окна)
    pub fn effective_class(&self) -> Option<&str> {
        self.window_class
            .as_deref()
            .filter(|c| !c.is_empty())
            .or_else(|| self.instance.as_deref().filter(|i| !i.is_empty()))
    }
}

impl fmt::Display for WindowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.effective_class() {
            Some(class) => write!(f, "#{} \"{}\" ({})", self.window_id, self.title, class),
            None => write!(f, "#{} \"{}\"", self.window_id, self.title),
        }
    }
}

/// Событие окна от оконного менеджера
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEvent {
    pub window: WindowIdentity,
    pub timestamp: std::time::Instant,
    pub event_type: WindowEventType,
}

impl WindowEvent {
    pub fn new(window: WindowIdentity, event_type: WindowEventType) -> Self {
        Self {
            window,
            timestamp: std::time::Instant::now(),
            event_type,
        }
    }
}

impl fmt::Display for WindowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {} ({}ms ago)",
            self.event_type,
            self.window,
            self.timestamp.elapsed().as_millis()
        )
    }
}

/// Тип события окна (поле `change` в протоколе)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowEventType {
    Created,
    Closed,
    FocusChanged,
    TitleChanged,
    Moved,
    MarkChanged,
    Other,
}

impl WindowEventType {
    pub fn from_change(change: &str) -> Self {
        match change {
            "new" => WindowEventType::Created,
            "close" => WindowEventType::Closed,
            "focus" => WindowEventType::FocusChanged,
            "title" => WindowEventType::TitleChanged,
            "move" => WindowEventType::Moved,
            "mark" => WindowEventType::MarkChanged,
            _ => WindowEventType::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_identity_creation() {
        let window = WindowIdentity::new(42, "Test Window".to_string())
            .with_class("TestApp")
            .with_pid(1234)
            .with_workspace("1");

        assert_eq!(window.window_class.as_deref(), Some("TestApp"));
        assert_eq!(window.pid, Some(1234));
        assert_eq!(window.resolution.scope, ResolvedScope::Unclassified);
    }

    #[test]
    fn test_effective_class_falls_back_to_instance() {
        let window = WindowIdentity::new(1, "t".into()).with_instance("foot");
        assert_eq!(window.effective_class(), Some("foot"));

        let window = WindowIdentity::new(1, "t".into()).with_class("");
        assert_eq!(window.effective_class(), None);
    }

    #[test]
    fn test_change_parsing() {
        assert_eq!(WindowEventType::from_change("new"), WindowEventType::Created);
        assert_eq!(WindowEventType::from_change("close"), WindowEventType::Closed);
        assert_eq!(WindowEventType::from_change("urgent"), WindowEventType::Other);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let r = Resolution::new(Scope::Scoped, ResolutionSource::Heuristic, 1.7);
        assert_eq!(r.confidence, 1.0);
    }
}
