use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::pattern::{PatternRule, Scope};

/// Файл классификации: явные списки и правила
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub scoped_classes: Vec<String>,
    #[serde(default)]
    pub global_classes: Vec<String>,
    #[serde(default, rename = "class_patterns")]
    pub patterns: Vec<PatternRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub level: IssueLevel,
    pub field: String,
    pub message: String,
    /// Класс, указанный сразу в обоих явных списках
    pub conflict: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ConfigIssue>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter().filter(|i| i.level == IssueLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter().filter(|i| i.level == IssueLevel::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Первая ошибка превращается в ScopeError, предупреждения остаются в отчёте
    pub fn into_result(self) -> Result<ValidationReport> {
        if let Some(issue) = self.errors().next() {
            return Err(match &issue.conflict {
                Some(class) => ScopeError::Conflict(class.clone()),
                None => ScopeError::config(issue.field.clone(), issue.message.clone()),
            });
        }
        Ok(self)
    }

    fn error(&mut self, field: String, message: String) {
        self.issues.push(ConfigIssue {
            level: IssueLevel::Error,
            field,
            message,
            conflict: None,
        });
    }

    fn conflict(&mut self, field: String, class: &str) {
        self.issues.push(ConfigIssue {
            level: IssueLevel::Error,
            field,
            message: format!(
                "класс '{}' уже есть в scoped_classes; удалите его из одного из списков",
                class
            ),
            conflict: Some(class.to_string()),
        });
    }

    fn warning(&mut self, field: String, message: String) {
        self.issues.push(ConfigIssue {
            level: IssueLevel::Warning,
            field,
            message,
            conflict: None,
        });
    }
}

impl ClassificationConfig {
    /// Разбор файла. Ошибки схемы содержат строку и столбец.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text).map_err(|e| {
            ScopeError::config(
                format!("строка {}, столбец {}", e.line(), e.column()),
                e.to_string(),
            )
        })
    }

    pub fn to_json(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        check_class_list(&mut report, "scoped_classes", &self.scoped_classes);
        check_class_list(&mut report, "global_classes", &self.global_classes);

        let scoped: HashSet<&str> = self.scoped_classes.iter().map(String::as_str).collect();
        for (i, class) in self.global_classes.iter().enumerate() {
            if scoped.contains(class.as_str()) {
                report.conflict(format!("global_classes[{}]", i), class);
            }
        }

        let mut seen: HashMap<(&str, u32), usize> = HashMap::new();
        for (i, rule) in self.patterns.iter().enumerate() {
            let field = format!("class_patterns[{}].pattern", i);
            if let Err(e) = rule.validate() {
                let message = match &e {
                    ScopeError::Pattern {
                        message,
                        position: Some(pos),
                        ..
                    } => format!("{} (позиция {})", message, pos),
                    ScopeError::Pattern { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                report.error(field, format!("'{}': {}", rule.pattern, message));
                continue;
            }
            if let Some(first) = seen.insert((rule.pattern.as_str(), rule.priority), i) {
                report.warning(
                    field,
                    format!(
                        "дубликат class_patterns[{}] ('{}', приоритет {})",
                        first, rule.pattern, rule.priority
                    ),
                );
            }
        }

        report
    }

    /// Явное членство класса
    pub fn explicit_scope(&self, class: &str) -> Option<Scope> {
        if self.scoped_classes.iter().any(|c| c == class) {
            Some(Scope::Scoped)
        } else if self.global_classes.iter().any(|c| c == class) {
            Some(Scope::Global)
        } else {
            None
        }
    }

    /// Добавляет класс в явный список. Если класс был в другом списке, он
    /// оттуда удаляется (последняя запись выигрывает); возвращает true в этом случае.
    pub fn set_explicit(&mut self, class: &str, scope: Scope) -> bool {
        let (target, other) = match scope {
            Scope::Scoped => (&mut self.scoped_classes, &mut self.global_classes),
            Scope::Global => (&mut self.global_classes, &mut self.scoped_classes),
        };
        let before = other.len();
        other.retain(|c| c != class);
        if !target.iter().any(|c| c == class) {
            target.push(class.to_string());
        }
        before != other.len()
    }

    pub fn remove_explicit(&mut self, class: &str) -> bool {
        let before = self.scoped_classes.len() + self.global_classes.len();
        self.scoped_classes.retain(|c| c != class);
        self.global_classes.retain(|c| c != class);
        before != self.scoped_classes.len() + self.global_classes.len()
    }
}

fn check_class_list(report: &mut ValidationReport, name: &str, classes: &[String]) {
    let mut seen = HashSet::new();
    for (i, class) in classes.iter().enumerate() {
        if class.trim().is_empty() {
            report.error(format!("{}[{}]", name, i), "пустое имя класса".to_string());
        } else if !seen.insert(class.as_str()) {
            report.warning(
                format!("{}[{}]", name, i),
                format!("класс '{}' указан повторно", class),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let text = r#"{
            "scoped_classes": ["Code", "Alacritty"],
            "global_classes": ["firefox"],
            "class_patterns": [
                {"pattern": "glob:pwa-*", "scope": "global", "priority": 100, "description": "PWA"}
            ]
        }"#;
        let config = ClassificationConfig::parse(text).unwrap();
        assert_eq!(config.scoped_classes.len(), 2);
        assert_eq!(config.patterns[0].priority, 100);
        assert!(!config.validate().has_errors());
    }

    #[test]
    fn test_unknown_field_reports_location() {
        let text = "{\n  \"scoped_classes\": [],\n  \"patterns\": []\n}";
        let err = ClassificationConfig::parse(text).unwrap_err();
        match err {
            ScopeError::Config { field, message } => {
                assert!(field.contains("строка 3"), "{field}");
                assert!(message.contains("patterns"));
            }
            other => panic!("неожиданная ошибка: {other}"),
        }
    }

    #[test]
    fn test_conflicting_membership_is_error() {
        let config = ClassificationConfig {
            scoped_classes: vec!["Code".into()],
            global_classes: vec!["Code".into()],
            patterns: vec![],
        };
        let report = config.validate();
        assert!(report.has_errors());
        assert_eq!(report.errors().next().unwrap().field, "global_classes[0]");
        match report.into_result() {
            Err(ScopeError::Conflict(class)) => assert_eq!(class, "Code"),
            other => panic!("ожидался Conflict: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_pattern_names_field() {
        let config = ClassificationConfig {
            patterns: vec![PatternRule {
                pattern: "regex:(".into(),
                scope: Scope::Global,
                priority: 1,
                description: None,
            }],
            ..Default::default()
        };
        let err = config.validate().into_result().unwrap_err();
        assert!(err.to_string().contains("class_patterns[0].pattern"));
    }

    #[test]
    fn test_duplicate_pattern_priority_is_warning() {
        let rule = PatternRule::new("Code", Scope::Scoped, 5).unwrap();
        let config = ClassificationConfig {
            patterns: vec![rule.clone(), rule],
            ..Default::default()
        };
        let report = config.validate();
        assert!(!report.has_errors());
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn test_set_explicit_moves_class() {
        let mut config = ClassificationConfig::default();
        assert!(!config.set_explicit("Code", Scope::Scoped));
        assert!(config.set_explicit("Code", Scope::Global));
        assert_eq!(config.explicit_scope("Code"), Some(Scope::Global));
        assert!(config.scoped_classes.is_empty());
    }
}
