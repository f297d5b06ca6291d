use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Целевая область, внедрённая лаунчером
pub const ENV_TARGET_SCOPE: &str = "SCOPEWM_TARGET_SCOPE";
/// Целевое рабочее пространство, внедрённое лаунчером
pub const ENV_TARGET_WORKSPACE: &str = "SCOPEWM_TARGET_WORKSPACE";
pub const ENV_PROJECT: &str = "SCOPEWM_PROJECT";
pub const ENV_APP_NAME: &str = "SCOPEWM_APP_NAME";

/// Переменные окружения процесса окна. Пустое окружение означает
/// "маркеров нет", а не ошибку.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnvironment {
    vars: HashMap<String, String>,
}

impl ProcessEnvironment {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Разбор содержимого `/proc/<pid>/environ` (записи разделены NUL)
    pub fn parse(raw: &[u8]) -> Self {
        let vars = raw
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let text = String::from_utf8_lossy(entry);
                let (key, value) = text.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn target_scope(&self) -> Option<&str> {
        self.get(ENV_TARGET_SCOPE)
    }

    pub fn target_workspace(&self) -> Option<&str> {
        self.get(ENV_TARGET_WORKSPACE)
    }

    pub fn project(&self) -> Option<&str> {
        self.get(ENV_PROJECT)
    }

    pub fn app_name(&self) -> Option<&str> {
        self.get(ENV_APP_NAME)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProcessEnvironment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Источник окружения процессов по PID
pub trait EnvironmentSource: Send + Sync {
    fn environment(&self, pid: u32) -> ProcessEnvironment;
}

/// Чтение окружения из procfs
pub struct ProcfsEnvironment {
    root: PathBuf,
}

impl Default for ProcfsEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsEnvironment {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    #[allow(dead_code)]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl EnvironmentSource for ProcfsEnvironment {
    fn environment(&self, pid: u32) -> ProcessEnvironment {
        let path = self.root.join(pid.to_string()).join("environ");
        match fs::read(&path) {
            Ok(raw) => ProcessEnvironment::parse(&raw),
            Err(e) => {
                // Процесс уже завершился или нет прав: продолжаем без маркеров
                debug!("Окружение процесса {} недоступно: {}", pid, e);
                ProcessEnvironment::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_environ() {
        let raw = b"HOME=/home/u\0SCOPEWM_PROJECT=nixos\0EMPTY=\0BROKEN\0";
        let env = ProcessEnvironment::parse(raw);
        assert_eq!(env.project(), Some("nixos"));
        assert_eq!(env.get("HOME"), Some("/home/u"));
        assert_eq!(env.get("EMPTY"), None);
        assert_eq!(env.get("BROKEN"), None);
    }

    #[test]
    fn test_procfs_reads_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("4242")).unwrap();
        fs::write(
            dir.path().join("4242/environ"),
            b"SCOPEWM_TARGET_SCOPE=global\0SCOPEWM_TARGET_WORKSPACE=3\0",
        )
        .unwrap();

        let source = ProcfsEnvironment::with_root(dir.path());
        let env = source.environment(4242);
        assert_eq!(env.target_scope(), Some("global"));
        assert_eq!(env.target_workspace(), Some("3"));
    }

    #[test]
    fn test_missing_process_yields_empty_environment() {
        let dir = tempfile::tempdir().unwrap();
        let source = ProcfsEnvironment::with_root(dir.path());
        assert!(source.environment(1).is_empty());
    }
}
