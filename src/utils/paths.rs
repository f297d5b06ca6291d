use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "scopewm";

pub fn config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join(APP_DIR);
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".config").join(APP_DIR);
    }

    PathBuf::from(".config").join(APP_DIR)
}

pub fn cache_dir() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(APP_DIR);
    }

    config_dir().join("cache")
}

/// Путь к файлу настроек по умолчанию
pub fn settings_path() -> PathBuf {
    config_dir().join("scopewm.toml")
}

/// Поиск исполняемого файла в PATH (абсолютные и относительные пути проверяются как есть)
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_in_path() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-4821").is_none());
    }

    #[test]
    fn test_absolute_path_checked_directly() {
        assert!(find_executable("/bin/sh").is_some());
        assert!(find_executable("/nonexistent/bin/tool").is_none());
    }
}
