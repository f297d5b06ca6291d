use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Что и как запускать для детекции
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub desktop_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            desktop_file: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_desktop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.desktop_file = Some(path.into());
        self
    }

    /// Разбирает командную строку: пробелы разделяют аргументы,
    /// одинарные и двойные кавычки их объединяют, `\` экранирует символ.
    pub fn parse(line: &str) -> Result<Self> {
        let words = split_command_line(line)?;
        let mut words = words.into_iter();
        let command = words
            .next()
            .ok_or_else(|| ScopeError::config("command", "пустая команда запуска"))?;
        Ok(Self::new(command).with_args(words))
    }

    /// Ключ кэша и имя для логов
    pub fn source_identifier(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Имя исполняемого файла без пути
    pub fn basename(&self) -> &str {
        Path::new(&self.command)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.command)
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source_identifier())
    }
}

pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ScopeError::config("command", "незакрытая кавычка"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotes_group_arguments() {
        let spec = LaunchSpec::parse(r#"code --new-window "/home/u/My Project" 'a b'"#).unwrap();
        assert_eq!(spec.command, "code");
        assert_eq!(spec.args, vec!["--new-window", "/home/u/My Project", "a b"]);
    }

    #[test]
    fn test_escapes_and_empty_quotes() {
        assert_eq!(split_command_line(r#"a\ b "" c"#).unwrap(), vec!["a b", "", "c"]);
    }

    #[test]
    fn test_unterminated_quote_rejected() {
        assert!(LaunchSpec::parse("code 'oops").is_err());
        assert!(LaunchSpec::parse("   ").is_err());
    }

    #[test]
    fn test_basename() {
        assert_eq!(LaunchSpec::new("/usr/bin/firefox").basename(), "firefox");
        assert_eq!(LaunchSpec::new("kitty").with_args(["-e", "htop"]).source_identifier(), "kitty -e htop");
    }
}
