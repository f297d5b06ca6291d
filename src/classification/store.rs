use crate::error::{Result, ScopeError};
use crate::events::ResolutionSource;
use crate::utils::atomic::{write_atomic, FileLock};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::cache::DEFAULT_CACHE_CAPACITY;
use super::config::{ClassificationConfig, ValidationReport};
use super::matcher::PatternMatcher;
use super::pattern::{PatternRule, Scope};

/// Мягкий лимит на время работы одного подписчика
pub const SUBSCRIBER_SOFT_LIMIT: Duration = Duration::from_millis(50);

/// Неизменяемый снимок конфигурации вместе со скомпилированными правилами.
/// Читатели берут Arc в начале шага обработки и работают только с ним.
#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub config: Arc<ClassificationConfig>,
    pub matcher: PatternMatcher,
}

impl Snapshot {
    /// Явные списки, затем правила. Эвристики здесь не применяются.
    pub fn classify(&self, class: &str) -> Option<(Scope, ResolutionSource)> {
        if let Some(scope) = self.config.explicit_scope(class) {
            return Some((scope, ResolutionSource::ExplicitList));
        }
        self.matcher
            .match_class(class)
            .map(|scope| (scope, ResolutionSource::Pattern))
    }
}

type Subscriber = Box<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Владелец конфигурации классификации.
///
/// Все изменения проходят через одну критическую секцию записи: проверка,
/// компиляция правил, атомарная запись на диск и только потом замена снимка
/// в памяти. При любой ошибке предыдущий снимок остаётся в силе.
pub struct ClassificationStore {
    path: PathBuf,
    cache_capacity: usize,
    unclassified_policy: Scope,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    subscribers: RwLock<Vec<Subscriber>>,
    versions: AtomicU64,
}

impl ClassificationStore {
    /// Читает и проверяет файл. Отсутствующий файл означает пустую конфигурацию.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClassificationConfig> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Файл классификации {:?} не найден, используем пустую конфигурацию", path);
                return Ok(ClassificationConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = ClassificationConfig::parse(&text)?;
        let report = config.validate().into_result()?;
        for issue in report.warnings() {
            warn!("{:?}: {}: {}", path, issue.field, issue.message);
        }
        Ok(config)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, Scope::Scoped, DEFAULT_CACHE_CAPACITY)
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        unclassified_policy: Scope,
        cache_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::load(&path)?;
        let matcher = PatternMatcher::compile_with_capacity(&config.patterns, cache_capacity)?;

        info!(
            "Загружена классификация из {:?}: scoped={}, global={}, правил={}",
            path,
            config.scoped_classes.len(),
            config.global_classes.len(),
            config.patterns.len()
        );

        Ok(Self {
            path,
            cache_capacity,
            unclassified_policy,
            current: RwLock::new(Arc::new(Snapshot {
                version: 1,
                config: Arc::new(config),
                matcher,
            })),
            writer: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            versions: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn config(&self) -> Arc<ClassificationConfig> {
        self.snapshot().config.clone()
    }

    /// Подписчики вызываются синхронно после каждой успешной записи или перезагрузки
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Box::new(callback));
    }

    pub fn save(&self, config: ClassificationConfig) -> Result<ValidationReport> {
        let _guard = self.writer.lock();
        let _file_lock = FileLock::exclusive(&self.path)?;
        self.commit_locked(config)
    }

    /// Перечитывает файл с диска (внешний сигнал перезагрузки)
    pub fn reload(&self) -> Result<Arc<Snapshot>> {
        let _guard = self.writer.lock();
        let config = Self::load(&self.path)?;
        let snapshot = self.install(config)?;
        info!("Классификация перезагружена, версия {}", snapshot.version);
        Ok(snapshot)
    }

    pub fn add_pattern(&self, rule: PatternRule) -> Result<ValidationReport> {
        rule.validate()?;
        self.mutate(|config| {
            config.patterns.push(rule);
            Ok(())
        })
    }

    /// Удаляет все правила с точно таким же текстом; возвращает их количество
    pub fn remove_pattern(&self, pattern: &str) -> Result<usize> {
        let mut removed = 0;
        self.mutate(|config| {
            let before = config.patterns.len();
            config.patterns.retain(|rule| rule.pattern != pattern);
            removed = before - config.patterns.len();
            if removed == 0 {
                return Err(ScopeError::config(
                    "class_patterns",
                    format!("правило '{}' не найдено", pattern),
                ));
            }
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn add_class(&self, class: &str, scope: Scope) -> Result<ValidationReport> {
        if class.trim().is_empty() {
            return Err(ScopeError::config("class", "пустое имя класса"));
        }
        self.mutate(|config| {
            if config.set_explicit(class, scope) {
                warn!(
                    "Класс '{}' перенесён в {} (последняя запись выигрывает)",
                    class, scope
                );
            }
            Ok(())
        })
    }

    pub fn remove_class(&self, class: &str) -> Result<ValidationReport> {
        self.mutate(|config| {
            if !config.remove_explicit(class) {
                return Err(ScopeError::config(
                    "class",
                    format!("класс '{}' не найден в явных списках", class),
                ));
            }
            Ok(())
        })
    }

    pub fn classify(&self, class: &str) -> Option<(Scope, ResolutionSource)> {
        self.snapshot().classify(class)
    }

    /// Порядок: scoped_classes, global_classes, правила, эвристика вызывающего,
    /// затем политика оператора для неклассифицированных окон.
    pub fn is_scoped(&self, class: &str, heuristic: Option<&dyn Fn(&str) -> Option<Scope>>) -> bool {
        if let Some((scope, _)) = self.classify(class) {
            return scope == Scope::Scoped;
        }
        if let Some(scope) = heuristic.and_then(|guess| guess(class)) {
            return scope == Scope::Scoped;
        }
        self.unclassified_policy == Scope::Scoped
    }

    fn mutate<F>(&self, apply: F) -> Result<ValidationReport>
    where
        F: FnOnce(&mut ClassificationConfig) -> Result<()>,
    {
        let _guard = self.writer.lock();
        let _file_lock = FileLock::exclusive(&self.path)?;
        // Изменение применяется к файлу на диске: другой процесс мог
        // записать его после нашей последней загрузки
        let mut config = Self::load(&self.path)?;
        apply(&mut config)?;
        self.commit_locked(config)
    }

    fn commit_locked(&self, config: ClassificationConfig) -> Result<ValidationReport> {
        let report = config.validate().into_result()?;
        let text = config.to_json()?;

        // Компилируем до записи: некорректные правила не должны попасть на диск
        let matcher = PatternMatcher::compile_with_capacity(&config.patterns, self.cache_capacity)?;
        write_atomic(&self.path, text.as_bytes())?;
        self.swap(config, matcher);
        Ok(report)
    }

    fn install(&self, config: ClassificationConfig) -> Result<Arc<Snapshot>> {
        let matcher = PatternMatcher::compile_with_capacity(&config.patterns, self.cache_capacity)?;
        Ok(self.swap(config, matcher))
    }

    fn swap(&self, config: ClassificationConfig, matcher: PatternMatcher) -> Arc<Snapshot> {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(Snapshot {
            version,
            config: Arc::new(config),
            matcher,
        });
        *self.current.write() = snapshot.clone();
        self.notify(&snapshot);
        snapshot
    }

    fn notify(&self, snapshot: &Arc<Snapshot>) {
        for (i, subscriber) in self.subscribers.read().iter().enumerate() {
            let started = Instant::now();
            subscriber(snapshot);
            let elapsed = started.elapsed();
            if elapsed > SUBSCRIBER_SOFT_LIMIT {
                warn!(
                    "Подписчик #{} обрабатывал снимок {} слишком долго: {:?}",
                    i, snapshot.version, elapsed
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn store_in(dir: &tempfile::TempDir) -> ClassificationStore {
        ClassificationStore::open(dir.path().join("classes.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.config().patterns.is_empty());
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn test_explicit_list_beats_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_class("Code", Scope::Scoped).unwrap();
        store
            .add_pattern(PatternRule::new("glob:Code*", Scope::Global, 1000).unwrap())
            .unwrap();

        assert_eq!(
            store.classify("Code"),
            Some((Scope::Scoped, ResolutionSource::ExplicitList))
        );
        assert_eq!(
            store.classify("Code-insiders"),
            Some((Scope::Global, ResolutionSource::Pattern))
        );
        assert!(store.is_scoped("Code", None));
    }

    #[test]
    fn test_save_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        {
            let store = ClassificationStore::open(&path).unwrap();
            store
                .add_pattern(PatternRule::new("glob:pwa-*", Scope::Global, 100).unwrap())
                .unwrap();
        }
        let reopened = ClassificationStore::open(&path).unwrap();
        assert_eq!(reopened.config().patterns.len(), 1);
        assert_eq!(reopened.classify("pwa-x").map(|r| r.0), Some(Scope::Global));
    }

    #[test]
    fn test_invalid_save_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        let store = ClassificationStore::open(&path).unwrap();
        store.add_class("Code", Scope::Scoped).unwrap();
        let before_disk = fs::read_to_string(&path).unwrap();
        let before_version = store.snapshot().version;

        let mut bad = (*store.config()).clone();
        bad.global_classes.push("Code".into());
        let err = store.save(bad).unwrap_err();
        assert!(matches!(err, ScopeError::Conflict(ref class) if class == "Code"));
        assert_eq!(err.exit_code(), 2);

        let mut bad_pattern = (*store.config()).clone();
        bad_pattern.patterns.push(PatternRule {
            pattern: "regex:(".into(),
            scope: Scope::Global,
            priority: 1,
            description: None,
        });
        assert!(store.save(bad_pattern).is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before_disk);
        assert_eq!(store.snapshot().version, before_version);
    }

    #[test]
    fn test_add_then_remove_restores_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .add_pattern(PatternRule::new("glob:*term*", Scope::Scoped, 10).unwrap())
            .unwrap();
        let inputs = ["xterm", "pwa-youtube", "Code"];
        let before: Vec<_> = inputs.iter().map(|c| store.classify(c)).collect();

        store
            .add_pattern(PatternRule::new("glob:pwa-*", Scope::Global, 100).unwrap())
            .unwrap();
        assert_eq!(store.remove_pattern("glob:pwa-*").unwrap(), 1);

        let after: Vec<_> = inputs.iter().map(|c| store.classify(c)).collect();
        assert_eq!(before, after);
        assert!(store.remove_pattern("glob:pwa-*").is_err());
    }

    #[test]
    fn test_crash_before_rename_keeps_original() {
        use atomic_write_file::AtomicWriteFile;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        let store = ClassificationStore::open(&path).unwrap();
        store.add_class("Code", Scope::Scoped).unwrap();

        let mut file = AtomicWriteFile::open(&path).unwrap();
        file.write_all(b"{\"scoped_classes\": [\"tru").unwrap();
        std::mem::forget(file);

        let config = ClassificationStore::load(&path).unwrap();
        assert_eq!(config.scoped_classes, vec!["Code".to_string()]);
    }

    #[test]
    fn test_subscribers_notified_on_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.subscribe(move |snapshot| {
            assert!(snapshot.version > 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store.add_class("Alacritty", Scope::Scoped).unwrap();
        store.reload().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_two_writers_on_one_file_keep_both_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        let cli = ClassificationStore::open(&path).unwrap();
        let daemon = ClassificationStore::open(&path).unwrap();

        cli.add_class("Alacritty", Scope::Scoped).unwrap();
        daemon
            .add_pattern(PatternRule::new("kitty", Scope::Scoped, 0).unwrap())
            .unwrap();

        let on_disk = ClassificationStore::load(&path).unwrap();
        assert_eq!(on_disk.scoped_classes, vec!["Alacritty".to_string()]);
        assert_eq!(on_disk.patterns.len(), 1);
        // Снимок записавшего процесса тоже видит чужую правку
        assert_eq!(
            daemon.classify("Alacritty"),
            Some((Scope::Scoped, ResolutionSource::ExplicitList))
        );
    }

    #[test]
    fn test_concurrent_writers_from_threads_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = ClassificationStore::open(&path).unwrap();
                    for i in 0..5 {
                        store.add_class(&format!("app-{}-{}", w, i), Scope::Global).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let on_disk = ClassificationStore::load(&path).unwrap();
        assert_eq!(on_disk.global_classes.len(), 20);
    }

    #[test]
    fn test_external_edit_picked_up_by_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        let store = ClassificationStore::open(&path).unwrap();
        fs::write(&path, r#"{"global_classes": ["firefox"]}"#).unwrap();

        assert_eq!(store.classify("firefox"), None);
        store.reload().unwrap();
        assert_eq!(store.classify("firefox").map(|r| r.0), Some(Scope::Global));
    }

    #[test]
    fn test_heuristic_and_policy_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ClassificationStore::open_with(dir.path().join("c.json"), Scope::Global, 16).unwrap();
        let guess = |class: &str| {
            if class.contains("term") {
                Some(Scope::Scoped)
            } else {
                None
            }
        };
        assert!(store.is_scoped("xterm", Some(&guess)));
        assert!(!store.is_scoped("mystery", Some(&guess)));
    }
}
