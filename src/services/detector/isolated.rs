use crate::error::ScopeError;
use crate::trace_if_enabled;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::backend::{DisplayBackend, WindowClass};
use super::display::{DisplayAllocator, DisplayLease};
use super::launch::LaunchSpec;
use super::process::{shutdown_process, ManagedProcess};
use super::result::DetectionResult;
use super::state::DetectionState;

#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    pub poll_interval: Duration,
    pub grace: Duration,
    pub ready_timeout: Duration,
    pub max_concurrent: usize,
}

impl DetectorOptions {
    pub fn from_config(config: &crate::config::DetectionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            grace: config.grace(),
            ready_timeout: config.ready_timeout(),
            max_concurrent: config.max_concurrent,
        }
    }
}

enum Outcome {
    Found(WindowClass),
    TimedOut,
    Cancelled,
    LaunchFailed(String),
    DisplayFailed(String),
}

/// Запускает приложение на изолированном виртуальном дисплее и
/// определяет класс его окна. Процессы и файлы дисплея убираются всегда.
pub struct IsolatedDetector {
    backend: Arc<dyn DisplayBackend>,
    displays: DisplayAllocator,
    permits: Arc<Semaphore>,
    options: DetectorOptions,
}

impl IsolatedDetector {
    pub fn new(backend: Arc<dyn DisplayBackend>, displays: DisplayAllocator, options: DetectorOptions) -> Self {
        Self {
            backend,
            displays,
            permits: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
            options,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DisplayBackend> {
        &self.backend
    }

    /// Детекция с таймаутом на всё от старта дисплея до появления окна.
    /// Вызовы сверх лимита ждут в очереди. `cancel` со значением true прерывает детекцию.
    pub async fn detect(
        &self,
        spec: &LaunchSpec,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> DetectionResult {
        let source = spec.source_identifier();

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return DetectionResult::failed(source, "детектор остановлен"),
        };

        let Some(lease) = self.displays.acquire(|n| self.backend.display_in_use(n)) else {
            return DetectionResult::failed(source, "нет свободного номера виртуального дисплея");
        };

        let started = Instant::now();
        let mut guard = CleanupGuard::new(Arc::clone(&self.backend), lease, self.options.grace);

        let outcome = {
            let run = self.run(spec, &mut guard);
            tokio::select! {
                result = tokio::time::timeout(timeout, run) => result.unwrap_or(Outcome::TimedOut),
                _ = wait_cancelled(cancel) => Outcome::Cancelled,
            }
        };

        let result = match outcome {
            Outcome::Found(window) => {
                guard.enter(DetectionState::Found);
                DetectionResult::isolated(source, window.class, window.instance)
            }
            Outcome::TimedOut => {
                let stage = guard.state;
                guard.enter(DetectionState::TimedOut);
                DetectionResult::failed(
                    source,
                    format!("окно не появилось за {:?} (этап {})", timeout, stage),
                )
            }
            Outcome::Cancelled => DetectionResult::failed(source, "детекция отменена"),
            Outcome::LaunchFailed(error) => {
                guard.enter(DetectionState::LaunchFailed);
                DetectionResult::failed(source, error)
            }
            Outcome::DisplayFailed(error) => DetectionResult::failed(source, error),
        };

        guard.shutdown().await;

        info!(
            "Детекция '{}': {} за {:?}",
            result.source_identifier,
            result
                .detected_class
                .as_deref()
                .or(result.error.as_deref())
                .unwrap_or_default(),
            started.elapsed()
        );
        result
    }

    async fn run(&self, spec: &LaunchSpec, guard: &mut CleanupGuard) -> Outcome {
        let display = guard.display_number();

        guard.enter(DetectionState::DisplayStarting);
        match self.backend.start_display(display).await {
            Ok(process) => {
                guard.display = Some(process);
                guard.owns_display = true;
            }
            Err(e) => return Outcome::DisplayFailed(display_error(e)),
        }
        if let Some(server) = guard.display.as_mut() {
            if let Err(e) = self
                .backend
                .wait_ready(display, server.as_mut(), self.options.ready_timeout)
                .await
            {
                // Сервер вышел сам: lock и сокет принадлежат другому X
                if server.poll_exit().is_some() {
                    guard.owns_display = false;
                }
                return Outcome::DisplayFailed(display_error(e));
            }
        }

        guard.enter(DetectionState::AppLaunching);
        let pid = match self.backend.launch_app(spec, display).await {
            Ok(process) => {
                let pid = process.pid();
                guard.app = Some(process);
                pid
            }
            Err(e) => return Outcome::LaunchFailed(e.to_string()),
        };

        guard.enter(DetectionState::Polling);
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        loop {
            ticker.tick().await;

            match self.backend.probe_window(display, pid).await {
                Ok(Some(window)) => return Outcome::Found(window),
                Ok(None) => {}
                Err(ScopeError::DependencyMissing(e)) => return Outcome::DisplayFailed(e),
                Err(e) => {
                    let display_num = display;
                    debug!("Опрос окна на :{}: {}", display_num, e)
                }
            }

            // Успешный выход допустим: лаунчер мог форкнуть настоящее приложение
            if let Some(false) = guard.app.as_mut().and_then(|app| app.poll_exit()) {
                return Outcome::LaunchFailed(format!(
                    "'{}' завершился с ошибкой до появления окна",
                    spec.command
                ));
            }
        }
    }
}

fn display_error(e: ScopeError) -> String {
    match e {
        ScopeError::DependencyMissing(message) => format!("зависимость недоступна: {}", message),
        other => other.to_string(),
    }
}

async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Отправитель исчез без отмены
            return std::future::pending().await;
        }
    }
}

/// Владеет процессами и номером дисплея одной детекции.
/// `shutdown` выполняет полную очистку; если до неё не дошло
/// (паника, drop future), Drop убивает всё синхронно.
struct CleanupGuard {
    backend: Arc<dyn DisplayBackend>,
    lease: DisplayLease,
    grace: Duration,
    state: DetectionState,
    display: Option<Box<dyn ManagedProcess>>,
    app: Option<Box<dyn ManagedProcess>>,
    /// Файлы дисплея созданы нашим сервером и подлежат удалению
    owns_display: bool,
    finished: bool,
}

impl CleanupGuard {
    fn new(backend: Arc<dyn DisplayBackend>, lease: DisplayLease, grace: Duration) -> Self {
        Self {
            backend,
            lease,
            grace,
            state: DetectionState::Idle,
            display: None,
            app: None,
            owns_display: false,
            finished: false,
        }
    }

    fn display_number(&self) -> u32 {
        self.lease.number()
    }

    fn enter(&mut self, next: DetectionState) {
        if !self.state.can_advance_to(next) {
            warn!("Неожиданный переход детекции {} -> {}", self.state, next);
        }
        trace_if_enabled!("Детекция на {}: {} -> {}", self.lease.display_name(), self.state, next);
        self.state = next;
    }

    fn remove_artifacts(&self) {
        if self.owns_display {
            self.backend.cleanup_artifacts(self.lease.number());
        } else {
            debug!("Файлы {} не наши, не трогаем", self.lease.display_name());
        }
    }

    /// Приложение, затем дисплей, затем файлы дисплея
    async fn shutdown(mut self) {
        self.enter(DetectionState::Terminating);

        // Процесс остаётся в guard до конца остановки: если future будет
        // отброшен посреди ожидания, Drop всё равно его добьёт
        let grace = self.grace;
        if let Some(app) = self.app.as_mut() {
            if let Err(e) = shutdown_process(app.as_mut(), "приложение", grace).await {
                warn!("{}", e);
            }
        }
        self.app = None;
        if let Some(display) = self.display.as_mut() {
            if let Err(e) = shutdown_process(display.as_mut(), "виртуальный дисплей", grace).await {
                warn!("{}", e);
            }
        }
        self.display = None;
        self.remove_artifacts();

        self.enter(DetectionState::Done);
        self.finished = true;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            "Аварийная очистка детекции на {} (этап {})",
            self.lease.display_name(),
            self.state
        );
        if let Some(app) = self.app.as_mut() {
            app.force_kill();
        }
        if let Some(display) = self.display.as_mut() {
            display.force_kill();
        }
        self.remove_artifacts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::scope_error;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Сценарий поведения фальшивого приложения
    #[derive(Clone, Copy, Debug)]
    enum AppBehavior {
        /// Окно появляется после n опросов
        WindowAfter(usize),
        NeverShowsWindow,
        CrashesImmediately,
        MissingBinary,
        IgnoresSigterm,
        /// Номер дисплея уже занят чужим X: наш сервер сразу выходит
        DisplayTaken,
    }

    #[derive(Default)]
    struct World {
        live: Mutex<HashSet<(String, u32)>>,
        artifacts: Mutex<HashSet<u32>>,
        /// Файлы дисплеев, созданные чужими X-серверами
        foreign: Mutex<HashSet<u32>>,
        displays_seen: Mutex<Vec<u32>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct FakeProcess {
        world: Arc<World>,
        key: (String, u32),
        ignores_term: bool,
        exit: Option<bool>,
        crashed: bool,
    }

    #[async_trait]
    impl ManagedProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.key.1)
        }

        fn poll_exit(&mut self) -> Option<bool> {
            if self.crashed && self.exit.is_none() {
                self.exit = Some(false);
                self.world.live.lock().remove(&self.key);
            }
            self.exit
        }

        fn terminate(&mut self) {
            if !self.ignores_term {
                self.exit.get_or_insert(true);
                self.world.live.lock().remove(&self.key);
            }
        }

        fn force_kill(&mut self) {
            self.exit.get_or_insert(false);
            self.world.live.lock().remove(&self.key);
        }

        async fn wait_exit(&mut self, timeout: Duration) -> bool {
            if self.poll_exit().is_none() {
                tokio::time::sleep(timeout).await;
            }
            self.poll_exit().is_some()
        }
    }

    struct FakeBackend {
        world: Arc<World>,
        behavior: AppBehavior,
        probes: Mutex<std::collections::HashMap<u32, usize>>,
        pids: AtomicUsize,
    }

    impl FakeBackend {
        fn new(behavior: AppBehavior) -> Self {
            Self {
                world: Arc::new(World::default()),
                behavior,
                probes: Mutex::new(Default::default()),
                pids: AtomicUsize::new(1000),
            }
        }

        fn spawn(&self, name: &str, ignores_term: bool, crashed: bool) -> Box<dyn ManagedProcess> {
            let pid = self.pids.fetch_add(1, Ordering::SeqCst) as u32;
            let key = (name.to_string(), pid);
            self.world.live.lock().insert(key.clone());
            Box::new(FakeProcess {
                world: Arc::clone(&self.world),
                key,
                ignores_term,
                exit: None,
                crashed,
            })
        }
    }

    #[async_trait]
    impl DisplayBackend for FakeBackend {
        fn check_dependencies(&self) -> Result<()> {
            Ok(())
        }

        fn display_in_use(&self, _display: u32) -> bool {
            false
        }

        async fn start_display(&self, display: u32) -> Result<Box<dyn ManagedProcess>> {
            if let AppBehavior::DisplayTaken = self.behavior {
                self.world.foreign.lock().insert(display);
                return Ok(self.spawn("Xvfb", false, true));
            }
            let now = self.world.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.world.peak.fetch_max(now, Ordering::SeqCst);
            self.world.displays_seen.lock().push(display);
            assert!(
                self.world.artifacts.lock().insert(display),
                "дисплей :{} уже используется другой детекцией",
                display
            );
            Ok(self.spawn("Xvfb", false, false))
        }

        async fn wait_ready(
            &self,
            display: u32,
            server: &mut dyn ManagedProcess,
            _timeout: Duration,
        ) -> Result<()> {
            tokio::task::yield_now().await;
            if server.poll_exit().is_some() {
                return Err(scope_error!(process, "X-сервер :{} завершился", display));
            }
            Ok(())
        }

        async fn launch_app(&self, spec: &LaunchSpec, _display: u32) -> Result<Box<dyn ManagedProcess>> {
            match self.behavior {
                AppBehavior::MissingBinary => {
                    Err(scope_error!(process, "не удалось запустить '{}': not found", spec.command))
                }
                AppBehavior::CrashesImmediately => Ok(self.spawn("app", false, true)),
                AppBehavior::IgnoresSigterm => Ok(self.spawn("app", true, false)),
                _ => Ok(self.spawn("app", false, false)),
            }
        }

        async fn probe_window(&self, display: u32, _pid: Option<u32>) -> Result<Option<WindowClass>> {
            let mut probes = self.probes.lock();
            let count = probes.entry(display).or_insert(0);
            *count += 1;
            let ready = match self.behavior {
                AppBehavior::WindowAfter(n) => *count > n,
                AppBehavior::IgnoresSigterm => *count > 1,
                _ => false,
            };
            Ok(ready.then(|| WindowClass {
                class: "FakeApp".into(),
                instance: Some("fakeapp".into()),
            }))
        }

        fn cleanup_artifacts(&self, display: u32) {
            self.world.foreign.lock().remove(&display);
            self.probes.lock().remove(&display);
            if self.world.artifacts.lock().remove(&display) {
                self.world.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn options() -> DetectorOptions {
        DetectorOptions {
            poll_interval: Duration::from_millis(5),
            grace: Duration::from_millis(5),
            ready_timeout: Duration::from_millis(50),
            max_concurrent: 3,
        }
    }

    fn detector(backend: Arc<FakeBackend>) -> IsolatedDetector {
        IsolatedDetector::new(backend, DisplayAllocator::new(99, 8), options())
    }

    fn assert_clean(world: &World) {
        assert!(world.live.lock().is_empty(), "живые процессы: {:?}", world.live.lock());
        assert!(world.artifacts.lock().is_empty(), "артефакты: {:?}", world.artifacts.lock());
    }

    #[tokio::test]
    async fn test_window_found() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::WindowAfter(2)));
        let detector = detector(Arc::clone(&backend));

        let result = detector.detect(&LaunchSpec::new("fakeapp"), Duration::from_secs(2), None).await;
        assert_eq!(result.detected_class.as_deref(), Some("FakeApp"));
        assert_eq!(result.detected_instance.as_deref(), Some("fakeapp"));
        assert!(result.validate().is_ok());
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_within_timeout() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::MissingBinary));
        let detector = detector(Arc::clone(&backend));

        let started = Instant::now();
        let result = detector
            .detect(&LaunchSpec::new("/nonexistent/app"), Duration::from_secs(10), None)
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.is_failed());
        assert!(result.detected_class.is_none());
        assert!(!result.error.unwrap_or_default().is_empty());
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_lost_display_race_keeps_foreign_files() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::DisplayTaken));
        let detector = detector(Arc::clone(&backend));

        let result = detector.detect(&LaunchSpec::new("fakeapp"), Duration::from_secs(2), None).await;
        assert!(result.is_failed());
        assert!(result.error.unwrap().contains("завершился"));
        assert_clean(&backend.world);
        assert_eq!(backend.world.foreign.lock().len(), 1, "удалены файлы чужого дисплея");
    }

    #[tokio::test]
    async fn test_crash_before_window_is_launch_failure() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::CrashesImmediately));
        let detector = detector(Arc::clone(&backend));
        let result = detector.detect(&LaunchSpec::new("crashy"), Duration::from_secs(2), None).await;
        assert!(result.is_failed());
        assert!(result.error.unwrap().contains("crashy"));
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_app_is_force_killed() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::IgnoresSigterm));
        let detector = detector(Arc::clone(&backend));
        let result = detector.detect(&LaunchSpec::new("stubborn"), Duration::from_secs(2), None).await;
        assert!(!result.is_failed());
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_cancel_handle_stops_detection() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::NeverShowsWindow));
        let detector = detector(Arc::clone(&backend));
        let (tx, rx) = watch::channel(false);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        let result = detector
            .detect(&LaunchSpec::new("slow"), Duration::from_secs(10), Some(rx))
            .await;
        cancel.await.unwrap();

        assert!(result.is_failed());
        assert!(result.error.unwrap().contains("отменена"));
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_dropped_future_cleans_up_synchronously() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::NeverShowsWindow));
        let detector = detector(Arc::clone(&backend));

        let spec = LaunchSpec::new("slow");
        let fut = detector.detect(&spec, Duration::from_secs(10), None);
        // Внешний таймаут отбрасывает future посреди опроса
        assert!(tokio::time::timeout(Duration::from_millis(40), fut).await.is_err());
        assert_clean(&backend.world);
    }

    #[tokio::test]
    async fn test_thousand_runs_leak_nothing() {
        let behaviors = [
            AppBehavior::WindowAfter(0),
            AppBehavior::WindowAfter(1),
            AppBehavior::NeverShowsWindow,
            AppBehavior::CrashesImmediately,
            AppBehavior::MissingBinary,
            AppBehavior::IgnoresSigterm,
        ];

        for i in 0..1000 {
            let behavior = behaviors[i % behaviors.len()];
            let backend = Arc::new(FakeBackend::new(behavior));
            let detector = detector(Arc::clone(&backend));
            let spec = LaunchSpec::new(format!("app-{}", i));

            match i % 3 {
                // Короткий таймаут детекции
                0 => {
                    detector.detect(&spec, Duration::from_millis(15), None).await;
                }
                // Отмена через watch
                1 => {
                    let (tx, rx) = watch::channel(false);
                    let fut = detector.detect(&spec, Duration::from_secs(5), Some(rx));
                    tokio::pin!(fut);
                    tokio::select! {
                        _ = &mut fut => {}
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            let _ = tx.send(true);
                            fut.await;
                        }
                    }
                }
                // Drop future
                _ => {
                    let _ = tokio::time::timeout(
                        Duration::from_millis(5),
                        detector.detect(&spec, Duration::from_secs(5), None),
                    )
                    .await;
                }
            }

            assert_clean(&backend.world);
            assert_eq!(detector.displays.in_use(), 0, "итерация {}", i);
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_capped_with_distinct_displays() {
        let backend = Arc::new(FakeBackend::new(AppBehavior::WindowAfter(3)));
        let detector = Arc::new(detector(Arc::clone(&backend)));

        let tasks: Vec<_> = (0..9)
            .map(|i| {
                let detector = Arc::clone(&detector);
                tokio::spawn(async move {
                    detector
                        .detect(&LaunchSpec::new(format!("app-{}", i)), Duration::from_secs(5), None)
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(!task.await.unwrap().is_failed());
        }

        assert!(backend.world.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(backend.world.displays_seen.lock().len(), 9);
        assert_clean(&backend.world);
    }
}
