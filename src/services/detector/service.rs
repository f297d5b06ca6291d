use crate::config::DetectionConfig;
use crate::error::Result;
use crate::utils::paths::find_executable;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::XvfbBackend;
use super::cache::DetectionCache;
use super::display::DisplayAllocator;
use super::isolated::{DetectorOptions, IsolatedDetector};
use super::launch::LaunchSpec;
use super::result::DetectionResult;

/// Параметры одного запроса
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub timeout: Duration,
    pub use_cache: bool,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl DetectRequest {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            use_cache: true,
            cancel: None,
        }
    }
}

/// Цепочка способов определить класс: кэш, .desktop-файл,
/// изолированный дисплей, эвристика по имени команды
pub struct DetectionService {
    detector: IsolatedDetector,
    cache: Mutex<DetectionCache>,
    desktop_dirs: Vec<PathBuf>,
}

impl DetectionService {
    pub fn new(detector: IsolatedDetector, cache: DetectionCache) -> Self {
        Self {
            detector,
            cache: Mutex::new(cache),
            desktop_dirs: default_desktop_dirs(),
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Result<Arc<Self>> {
        let backend = Arc::new(XvfbBackend::new(config.clone()));
        let displays = DisplayAllocator::new(config.display_base, config.display_pool_size);
        let detector = IsolatedDetector::new(backend, displays, DetectorOptions::from_config(config));
        let cache = DetectionCache::load(&config.cache_path, config.cache_ttl_days)?;
        Ok(Arc::new(Self::new(detector, cache)))
    }

    pub fn with_desktop_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.desktop_dirs = dirs;
        self
    }

    pub async fn detect(&self, spec: &LaunchSpec, request: DetectRequest) -> DetectionResult {
        let source = spec.source_identifier();

        if request.use_cache {
            let cached = self.cache.lock().get(&source).cloned();
            if let Some(cached) = cached {
                debug!("Детекция '{}' из кэша", source);
                return cached;
            }
        }

        let result = self.detect_uncached(spec, request).await;

        if result.is_cacheable() {
            let mut cache = self.cache.lock();
            cache.insert(result.clone());
            if let Err(e) = cache.save() {
                warn!("Не удалось сохранить кэш детекции: {}", e);
            }
        }
        result
    }

    async fn detect_uncached(&self, spec: &LaunchSpec, request: DetectRequest) -> DetectionResult {
        let source = spec.source_identifier();

        if let Some(class) = self.desktop_class(spec) {
            info!("Класс '{}' для '{}' взят из .desktop-файла", class, source);
            return DetectionResult::desktop(source, class);
        }

        if let Err(e) = self.detector.backend().check_dependencies() {
            warn!("{}; используется эвристика по имени команды", e);
            return heuristic_result(spec);
        }

        self.detector.detect(spec, request.timeout, request.cancel).await
    }

    fn desktop_class(&self, spec: &LaunchSpec) -> Option<String> {
        if let Some(path) = &spec.desktop_file {
            return read_startup_wm_class(path);
        }
        let file_name = format!("{}.desktop", spec.basename());
        self.desktop_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find_map(|path| read_startup_wm_class(&path))
    }
}

/// Класс по имени команды. Команда должна существовать: для
/// отсутствующего бинарника угадывать нечего.
fn heuristic_result(spec: &LaunchSpec) -> DetectionResult {
    let name = spec.basename();
    if name.is_empty() {
        return DetectionResult::failed(spec.source_identifier(), "пустое имя команды");
    }
    if find_executable(&spec.command).is_none() {
        return DetectionResult::failed(
            spec.source_identifier(),
            format!("команда '{}' не найдена", spec.command),
        );
    }
    DetectionResult::heuristic(spec.source_identifier(), name)
}

fn default_desktop_dirs() -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();
    if let Some(data) = dirs::data_dir() {
        dirs_list.push(data.join("applications"));
    }
    dirs_list.push(PathBuf::from("/usr/local/share/applications"));
    dirs_list.push(PathBuf::from("/usr/share/applications"));
    dirs_list
}

/// Значение `StartupWMClass` из секции `[Desktop Entry]`
pub fn read_startup_wm_class(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    parse_startup_wm_class(&text)
}

pub fn parse_startup_wm_class(text: &str) -> Option<String> {
    let mut in_entry = false;
    for line in text.lines().map(str::trim) {
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "StartupWMClass" {
                let value = value.trim();
                return (!value.is_empty()).then(|| value.to_string());
            }
        }
    }
    None
}
