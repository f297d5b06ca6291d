use crate::error::{Result, ScopeError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const GLOB_PREFIX: &str = "glob:";
pub const REGEX_PREFIX: &str = "regex:";

/// Область видимости окна: привязано к активному проекту или видно всегда
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Scoped,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Scoped => "scoped",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "scoped" => Ok(Scope::Scoped),
            "global" => Ok(Scope::Global),
            other => Err(ScopeError::config(
                "scope",
                format!("неизвестная область '{}', ожидается scoped или global", other),
            )),
        }
    }
}

/// Вид правила, определяется префиксом исходного текста
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Literal,
    Glob,
    Regex,
}

impl PatternKind {
    /// Разбирает префикс: возвращает вид и тело правила без префикса
    pub fn split(raw: &str) -> (PatternKind, &str) {
        if let Some(body) = raw.strip_prefix(GLOB_PREFIX) {
            (PatternKind::Glob, body)
        } else if let Some(body) = raw.strip_prefix(REGEX_PREFIX) {
            (PatternKind::Regex, body)
        } else {
            (PatternKind::Literal, raw)
        }
    }
}

/// Правило классификации. Неизменяемо после создания.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    pub pattern: String,
    pub scope: Scope,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PatternRule {
    /// Создаёт правило с проверкой синтаксиса
    pub fn new(pattern: impl Into<String>, scope: Scope, priority: u32) -> Result<Self> {
        let rule = Self {
            pattern: pattern.into(),
            scope,
            priority,
            description: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(&self) -> PatternKind {
        PatternKind::split(&self.pattern).0
    }

    pub fn body(&self) -> &str {
        PatternKind::split(&self.pattern).1
    }

    pub fn validate(&self) -> Result<()> {
        if self.body().is_empty() {
            return Err(ScopeError::Pattern {
                pattern: self.pattern.clone(),
                message: "пустой паттерн".to_string(),
                position: None,
            });
        }
        self.compile_regex().map(|_| ())
    }

    /// Компилирует тело правила в регулярное выражение (для glob и regex).
    /// Для литерала возвращает None.
    pub fn compile_regex(&self) -> Result<Option<Regex>> {
        let (kind, body) = PatternKind::split(&self.pattern);
        let source = match kind {
            PatternKind::Literal => return Ok(None),
            PatternKind::Glob => glob_to_regex(body),
            PatternKind::Regex => body.to_string(),
        };

        Regex::new(&source).map(Some).map_err(|e| ScopeError::Pattern {
            pattern: self.pattern.clone(),
            message: e.to_string(),
            position: regex_error_position(&e),
        })
    }
}

impl fmt::Display for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} (priority {})", self.pattern, self.scope, self.priority)
    }
}

/// Переводит glob (`*`, `?`, `[...]`) в якорное регулярное выражение
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                // Класс символов копируем как есть, `!` в начале превращаем в `^`
                let mut class = String::from("[");
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed {
                    class.push(']');
                    out.push_str(&class);
                } else {
                    // Незакрытая скобка трактуется буквально
                    out.push_str(&regex::escape(&class));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    out
}

fn regex_error_position(err: &regex::Error) -> Option<usize> {
    // regex сообщает позицию только в тексте ошибки: строка с `^` под
    // ошибочным символом, с отступом в 4 пробела
    let text = err.to_string();
    let marker = text.lines().find(|line| line.trim_start().starts_with('^'))?;
    let offset = marker.find('^')?;
    Some(offset.saturating_sub(4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_parsing() {
        assert_eq!(PatternKind::split("glob:pwa-*"), (PatternKind::Glob, "pwa-*"));
        assert_eq!(PatternKind::split("regex:^fire"), (PatternKind::Regex, "^fire"));
        assert_eq!(PatternKind::split("Code"), (PatternKind::Literal, "Code"));
    }

    #[test]
    fn test_glob_translation() {
        let re = Regex::new(&glob_to_regex("pwa-*")).unwrap();
        assert!(re.is_match("pwa-youtube"));
        assert!(!re.is_match("xpwa-youtube"));

        let re = Regex::new(&glob_to_regex("term?nal.[ab]")).unwrap();
        assert!(re.is_match("terminal.a"));
        assert!(!re.is_match("terminal.c"));

        let re = Regex::new(&glob_to_regex("[!x]y")).unwrap();
        assert!(re.is_match("ay"));
        assert!(!re.is_match("xy"));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let err = PatternRule::new("regex:fire(fox", Scope::Global, 10).unwrap_err();
        match err {
            ScopeError::Pattern { pattern, .. } => assert_eq!(pattern, "regex:fire(fox"),
            other => panic!("неожиданная ошибка: {other}"),
        }
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(PatternRule::new("", Scope::Scoped, 0).is_err());
        assert!(PatternRule::new("glob:", Scope::Scoped, 0).is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("Scoped".parse::<Scope>().unwrap(), Scope::Scoped);
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::Global);
        assert!("project".parse::<Scope>().is_err());
    }
}
