//! WindowIdentityResolver: разрешение области окна по уровням.
//!
//! Уровень 0 - классы, у которых один процесс владеет несколькими окнами:
//! решение по заголовку, окружение процесса не читается.
//! Уровень 1 - явные маркеры лаунчера в окружении процесса.
//! Уровень 2 - имя приложения из окружения + реестр приложений.
//! Уровень 3 - классы: явные списки и правила (raw > instance > нормализованный).
//! Уровень 4 - эвристика по ключевым словам.

pub mod environment;
pub mod heuristic;
pub mod registry;

use crate::classification::{ClassificationStore, Scope, Snapshot};
use crate::debug_if_enabled;
use crate::error::{Result, ScopeError};
use crate::events::{Resolution, ResolutionSource, WindowIdentity};
use regex::Regex;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::sync::Arc;

pub use environment::{EnvironmentSource, ProcessEnvironment, ProcfsEnvironment};
pub use registry::{AppEntry, AppRegistry};

const ENV_TARGET_CONFIDENCE: f32 = 1.0;
const REGISTRY_CONFIDENCE: f32 = 0.95;
const TITLE_RULE_CONFIDENCE: f32 = 0.8;

/// Правило заголовка для классов с общим процессом.
/// Регулярные выражения должны содержать группу `project`.
/// Роль окна (WM_WINDOW_ROLE) проверяется, если заголовок не подошёл.
#[derive(Debug, Clone)]
pub struct TitleRule {
    pub class: String,
    pub title: Regex,
    pub role: Option<Regex>,
}

impl TitleRule {
    pub fn new(class: impl Into<String>, title_pattern: &str) -> Result<Self> {
        Ok(Self {
            class: class.into(),
            title: project_regex(title_pattern)?,
            role: None,
        })
    }

    pub fn with_role(mut self, role_pattern: &str) -> Result<Self> {
        self.role = Some(project_regex(role_pattern)?);
        Ok(self)
    }

    /// Проект из заголовка, затем из роли окна
    fn project(&self, identity: &WindowIdentity) -> Option<String> {
        let from_title = capture_project(&self.title, &identity.title);
        from_title.or_else(|| {
            let role = self.role.as_ref()?;
            capture_project(role, identity.window_role.as_deref()?)
        })
    }
}

fn project_regex(pattern: &str) -> Result<Regex> {
    let regex = Regex::new(pattern).map_err(|e| ScopeError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
        position: None,
    })?;
    if !regex.capture_names().any(|name| name == Some("project")) {
        return Err(ScopeError::Pattern {
            pattern: pattern.to_string(),
            message: "нет именованной группы (?P<project>...)".to_string(),
            position: None,
        });
    }
    Ok(regex)
}

fn capture_project(regex: &Regex, text: &str) -> Option<String> {
    let captures = regex.captures(text)?;
    let project = captures.name("project")?.as_str().trim();
    (!project.is_empty()).then(|| project.to_string())
}

pub struct WindowIdentityResolver {
    store: Arc<ClassificationStore>,
    registry: Arc<AppRegistry>,
    shared_process_classes: HashSet<String>,
    title_rules: Vec<TitleRule>,
}

impl WindowIdentityResolver {
    pub fn new(store: Arc<ClassificationStore>, registry: Arc<AppRegistry>) -> Self {
        Self {
            store,
            registry,
            shared_process_classes: HashSet::new(),
            title_rules: Vec::new(),
        }
    }

    pub fn with_shared_process_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared_process_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title_rules(mut self, rules: Vec<TitleRule>) -> Self {
        for rule in &rules {
            self.shared_process_classes.insert(rule.class.clone());
        }
        self.title_rules = rules;
        self
    }

    pub fn store(&self) -> &Arc<ClassificationStore> {
        &self.store
    }

    /// Разрешает область окна на текущем снимке конфигурации
    pub fn resolve(&self, identity: WindowIdentity, env: &ProcessEnvironment) -> WindowIdentity {
        let snapshot = self.store.snapshot();
        self.resolve_with(&snapshot, identity, env)
    }

    /// Разрешение на заданном снимке: снимок берётся один раз на шаг обработки
    pub fn resolve_with(
        &self,
        snapshot: &Snapshot,
        mut identity: WindowIdentity,
        env: &ProcessEnvironment,
    ) -> WindowIdentity {
        let resolution = self.resolve_resolution(snapshot, &identity, env);
        debug_if_enabled!(
            "Resolver: {} -> {} via {:?} ({:.2})",
            identity,
            resolution.scope,
            resolution.source,
            resolution.confidence
        );
        identity.resolution = resolution;
        identity
    }

    fn resolve_resolution(
        &self,
        snapshot: &Snapshot,
        identity: &WindowIdentity,
        env: &ProcessEnvironment,
    ) -> Resolution {
        let shared = self.is_shared_process(identity);

        // Уровень 0: окружение общего процесса ненадёжно, смотрим на заголовок
        if shared {
            if let Some(resolution) = self.resolve_by_title(identity) {
                return resolution;
            }
        } else {
            if let Some(resolution) = resolve_env_target(env) {
                return resolution;
            }
            if let Some(resolution) = self.resolve_registry(env) {
                return resolution;
            }
        }

        let target_workspace = if shared {
            None
        } else {
            env.target_workspace().map(str::to_string)
        };
        let project = if shared {
            None
        } else {
            env.project().map(str::to_string)
        };

        if let Some(resolution) = resolve_by_class(snapshot, identity) {
            return resolution
                .with_project(project)
                .with_target_workspace(target_workspace);
        }

        if let Some(guess) = heuristic::guess(identity.effective_class(), &identity.title) {
            return Resolution::new(guess.scope, ResolutionSource::Heuristic, guess.confidence)
                .with_project(project)
                .with_target_workspace(target_workspace);
        }

        Resolution::default().with_target_workspace(target_workspace)
    }

    /// Класс с общим процессом на несколько окон (решение по заголовку)
    pub fn is_shared_process(&self, identity: &WindowIdentity) -> bool {
        identity
            .effective_class()
            .map(|class| {
                self.shared_process_classes.contains(class)
                    || self.shared_process_classes.contains(&normalize_class(class))
            })
            .unwrap_or(false)
    }

    fn resolve_by_title(&self, identity: &WindowIdentity) -> Option<Resolution> {
        let class = identity.effective_class()?;
        let normalized = normalize_class(class);
        self.title_rules
            .iter()
            .filter(|rule| rule.class == class || rule.class == normalized)
            .find_map(|rule| {
                let project = rule.project(identity)?;
                Some(
                    Resolution::new(Scope::Scoped, ResolutionSource::Heuristic, TITLE_RULE_CONFIDENCE)
                        .with_project(Some(project)),
                )
            })
    }

    fn resolve_registry(&self, env: &ProcessEnvironment) -> Option<Resolution> {
        let app_name = env.app_name()?;
        let entry = self.registry.get(app_name)?;
        let scope = entry.scope?;
        let workspace = env
            .target_workspace()
            .map(str::to_string)
            .or_else(|| entry.preferred_workspace.clone());
        Some(
            Resolution::new(scope, ResolutionSource::EnvironmentTarget, REGISTRY_CONFIDENCE)
                .with_project(env.project().map(str::to_string))
                .with_target_workspace(workspace),
        )
    }
}

/// Уровень 1: маркеры лаунчера используются напрямую
fn resolve_env_target(env: &ProcessEnvironment) -> Option<Resolution> {
    let scope = match env.target_scope() {
        Some(raw) => raw.parse::<Scope>().ok()?,
        None if env.project().is_some() => Scope::Scoped,
        None => return None,
    };
    Some(
        Resolution::new(scope, ResolutionSource::EnvironmentTarget, ENV_TARGET_CONFIDENCE)
            .with_project(env.project().map(str::to_string))
            .with_target_workspace(env.target_workspace().map(str::to_string)),
    )
}

/// Уровень 3: raw-класс, затем instance, затем нормализованная форма
fn resolve_by_class(snapshot: &Snapshot, identity: &WindowIdentity) -> Option<Resolution> {
    let mut candidates: SmallVec<[String; 4]> = SmallVec::new();
    let mut push = |value: &str| {
        if !value.is_empty() && !candidates.iter().any(|c| c == value) {
            candidates.push(value.to_string());
        }
    };

    if let Some(class) = identity.window_class.as_deref() {
        push(class);
    }
    if let Some(instance) = identity.instance.as_deref() {
        push(instance);
    }
    if let Some(class) = identity.effective_class() {
        push(&normalize_class(class));
    }

    candidates.iter().enumerate().find_map(|(rank, candidate)| {
        let (scope, source) = snapshot.classify(candidate)?;
        let base = match source {
            ResolutionSource::ExplicitList => 1.0,
            _ => 0.9,
        };
        // Менее точные кандидаты получают чуть меньшую уверенность
        let confidence = base - 0.05 * rank as f32;
        Some(Resolution::new(scope, source, confidence))
    })
}

/// Нормализация класса: убираем обратный доменный префикс и приводим к нижнему регистру.
/// `org.gnome.Nautilus` -> `nautilus`, `Code` -> `code`.
pub fn normalize_class(class: &str) -> String {
    const DOMAIN_ROOTS: &[&str] = &["org", "com", "net", "io", "dev", "app", "de", "me", "us"];

    let segments: Vec<&str> = class.split('.').filter(|s| !s.is_empty()).collect();
    let base = if segments.len() >= 3
        || (segments.len() == 2 && DOMAIN_ROOTS.contains(&segments[0].to_lowercase().as_str()))
    {
        segments.last().copied().unwrap_or(class)
    } else {
        class
    };
    base.to_lowercase()
}
