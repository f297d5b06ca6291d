use crate::classification::Scope;
use crate::events::{ResolvedScope, WindowIdentity};

pub const MARK_PREFIX: &str = "scopewm:";

/// Что сделать с окном после разрешения области
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAction {
    pub window_id: u64,
    pub scope: Scope,
    pub mark: String,
    /// Старые метки scopewm на этом же окне
    pub stale_marks: Vec<String>,
    pub move_to: Option<String>,
}

impl WindowAction {
    /// Решение для разрешённого окна. Неклассифицированные окна
    /// получают `default_action`; scoped-окно без своего проекта берёт активный.
    pub fn plan(identity: &WindowIdentity, default_action: Scope, active_project: Option<&str>) -> Self {
        let resolution = &identity.resolution;
        let scope = match resolution.scope {
            ResolvedScope::Scoped => Scope::Scoped,
            ResolvedScope::Global => Scope::Global,
            ResolvedScope::Unclassified => default_action,
        };

        let project = match scope {
            Scope::Scoped => resolution.project.as_deref().or(active_project),
            Scope::Global => None,
        };
        let mark = mark_for(identity.window_id, scope, project);

        let stale_marks = identity
            .marks
            .iter()
            .filter(|m| m.starts_with(MARK_PREFIX) && **m != mark)
            .cloned()
            .collect();

        let move_to = resolution
            .target_workspace
            .clone()
            .filter(|ws| !ws.is_empty() && *ws != identity.workspace);

        Self {
            window_id: identity.window_id,
            scope,
            mark,
            stale_marks,
            move_to,
        }
    }

    /// Команды для RUN_COMMAND. Пусто, если окно уже помечено как нужно.
    pub fn commands(&self, current_marks: &std::collections::BTreeSet<String>) -> Vec<String> {
        let target = format!("[con_id={}]", self.window_id);
        let mut commands = Vec::new();

        if !current_marks.contains(&self.mark) {
            for stale in &self.stale_marks {
                commands.push(format!("{} unmark {}", target, quote(stale)));
            }
            commands.push(format!("{} mark --add {}", target, quote(&self.mark)));
            if let Some(workspace) = &self.move_to {
                commands.push(format!("{} move container to workspace {}", target, quote(workspace)));
            }
        }
        commands
    }
}

/// `scopewm:scoped:<id>`, `scopewm:scoped:<project>:<id>`, `scopewm:global:<id>`.
/// Метки в i3/sway уникальны, поэтому в них входит id окна.
pub fn mark_for(window_id: u64, scope: Scope, project: Option<&str>) -> String {
    match (scope, project.filter(|p| !p.is_empty())) {
        (Scope::Scoped, Some(project)) => format!("{}scoped:{}:{}", MARK_PREFIX, project, window_id),
        (scope, _) => format!("{}{}:{}", MARK_PREFIX, scope, window_id),
    }
}

/// Аргумент команды i3 в двойных кавычках
pub fn quote(arg: &str) -> String {
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
