//! EventDaemon: долгоживущий цикл, который помечает окна по мере появления.
//!
//! Одна сессия на IPC-соединение: подписка, сверка всего дерева, затем
//! события окон и управляющие команды строго по одной. Ошибка транспорта
//! завершает сессию, и демон переподключается с нарастающей паузой.
//! `run` завершается только по `Shutdown`.

pub mod actions;
pub mod ledger;
pub mod stats;

use crate::classification::{ClassificationStore, Scope};
use crate::config::Config;
use crate::debug_if_enabled;
use crate::error::{Result, ScopeError};
use crate::events::{ResolvedScope, WindowEventType, WindowIdentity};
use crate::resolver::heuristic;
use crate::resolver::{EnvironmentSource, ProcessEnvironment, WindowIdentityResolver};
use crate::services::detector::{DetectRequest, DetectionResult, DetectionService, LaunchSpec};
use crate::services::ipc::{EventKind, WmConnection, WmConnector, WmEvent};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use actions::WindowAction;
use ledger::{LedgerEntry, WindowLedger};
use stats::{Backoff, DaemonStats, StatsSnapshot};

const COMMAND_QUEUE: usize = 64;

/// Управляющие сообщения, обрабатываются в том же цикле, что и события
#[derive(Debug, Clone)]
pub enum DaemonCommand {
    Reload,
    /// Результат фоновой детекции
    Learn(DetectionResult),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Disconnected,
    Connecting,
    Subscribed,
    Processing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub default_action: Scope,
    pub reload_tick: String,
    pub detect_tick_prefix: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub detect_timeout: Duration,
    pub active_project_path: Option<PathBuf>,
    pub dry_run: bool,
}

impl DaemonSettings {
    pub fn from_config(config: &Config, dry_run: bool) -> Self {
        Self {
            default_action: config.classification.default_action,
            reload_tick: config.ipc.reload_tick.clone(),
            detect_tick_prefix: config.ipc.detect_tick_prefix.clone(),
            reconnect_initial: config.ipc.reconnect_initial(),
            reconnect_max: config.ipc.reconnect_max(),
            detect_timeout: config.detection.timeout(),
            active_project_path: Some(config.classification.active_project_path.clone()),
            dry_run,
        }
    }
}

/// Дескриптор для управления запущенным демоном из других задач
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<DaemonCommand>,
    state: watch::Receiver<DaemonState>,
    stats: Arc<DaemonStats>,
}

impl DaemonHandle {
    pub async fn send(&self, command: DaemonCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ScopeError::Internal("демон уже остановлен".to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(DaemonCommand::Shutdown).await
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Подписка на смену состояния
    pub fn watch_state(&self) -> watch::Receiver<DaemonState> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected(ScopeError),
}

enum Step {
    Event(Result<WmEvent>),
    Command(Option<DaemonCommand>),
    DetectionFinished(std::result::Result<(), tokio::task::JoinError>),
}

/// Продолжать ли сеанс после обработки события
enum Flow {
    Continue,
    Stop,
}

pub struct EventDaemon {
    connector: Arc<dyn WmConnector>,
    resolver: Arc<WindowIdentityResolver>,
    environment: Arc<dyn EnvironmentSource>,
    detection: Option<Arc<DetectionService>>,
    settings: DaemonSettings,
    ledger: WindowLedger,
    stats: Arc<DaemonStats>,
    commands_tx: mpsc::Sender<DaemonCommand>,
    commands_rx: mpsc::Receiver<DaemonCommand>,
    state_tx: watch::Sender<DaemonState>,
    detections: JoinSet<()>,
}

impl EventDaemon {
    pub fn new(
        connector: Arc<dyn WmConnector>,
        resolver: Arc<WindowIdentityResolver>,
        environment: Arc<dyn EnvironmentSource>,
        settings: DaemonSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, _) = watch::channel(DaemonState::Disconnected);
        Self {
            connector,
            resolver,
            environment,
            detection: None,
            settings,
            ledger: WindowLedger::new(),
            stats: Arc::new(DaemonStats::default()),
            commands_tx,
            commands_rx,
            state_tx,
            detections: JoinSet::new(),
        }
    }

    pub fn with_detection(mut self, detection: Arc<DetectionService>) -> Self {
        self.detection = Some(detection);
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            commands: self.commands_tx.clone(),
            state: self.state_tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    fn store(&self) -> &Arc<ClassificationStore> {
        self.resolver.store()
    }

    fn set_state(&self, state: DaemonState) {
        debug_if_enabled!("EventDaemon: {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Работает до команды Shutdown или события shutdown(exit) оконного менеджера
    pub async fn run(mut self) -> StatsSnapshot {
        info!(
            "EventDaemon запущен{}",
            if self.settings.dry_run { " (dry-run)" } else { "" }
        );
        let mut backoff = Backoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);

        loop {
            self.set_state(DaemonState::Connecting);
            let end = match self.connector.connect().await {
                Ok(conn) => self.session(conn, &mut backoff).await,
                Err(e) => SessionEnd::Disconnected(e),
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected(e) => {
                    self.set_state(DaemonState::Disconnected);
                    let delay = backoff.next_delay();
                    warn!("Нет соединения с оконным менеджером ({}), повтор через {:?}", e, delay);
                    if self.wait_reconnect(delay).await {
                        break;
                    }
                    self.stats.reconnect();
                }
            }
        }

        self.stop().await
    }

    /// Пауза перед переподключением; команды при этом обрабатываются.
    /// true - пришла команда остановки.
    async fn wait_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let command = tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands_rx.recv() => command,
            };
            match command {
                None | Some(DaemonCommand::Shutdown) => return true,
                Some(DaemonCommand::Reload) => self.reload(),
                Some(DaemonCommand::Learn(result)) => self.learn(result),
            }
        }
    }

    async fn session(&mut self, mut conn: Box<dyn WmConnection>, backoff: &mut Backoff) -> SessionEnd {
        if let Err(e) = conn
            .subscribe(&[EventKind::Window, EventKind::Tick, EventKind::Shutdown])
            .await
        {
            return SessionEnd::Disconnected(e);
        }
        self.set_state(DaemonState::Subscribed);
        backoff.reset();

        if let Err(e) = self.reconcile(conn.as_mut()).await {
            if e.is_transport() {
                return SessionEnd::Disconnected(e);
            }
            error!("Сверка дерева окон не удалась: {}", e);
        }

        self.set_state(DaemonState::Processing);
        info!("Подключено к оконному менеджеру, окон в журнале: {}", self.ledger.len());

        loop {
            let step = tokio::select! {
                event = conn.next_event() => Step::Event(event),
                command = self.commands_rx.recv() => Step::Command(command),
                Some(joined) = self.detections.join_next(), if !self.detections.is_empty() => {
                    Step::DetectionFinished(joined)
                }
            };

            let outcome = match step {
                Step::Event(Ok(event)) => self.handle_event(conn.as_mut(), event).await,
                Step::Event(Err(e)) => Err(e),
                Step::Command(None) | Step::Command(Some(DaemonCommand::Shutdown)) => Ok(Flow::Stop),
                Step::Command(Some(DaemonCommand::Reload)) => {
                    self.reload();
                    self.reconcile(conn.as_mut()).await.map(|_| Flow::Continue)
                }
                Step::Command(Some(DaemonCommand::Learn(result))) => {
                    self.learn(result);
                    Ok(Flow::Continue)
                }
                Step::DetectionFinished(joined) => {
                    if let Err(e) = joined {
                        error!("Задача детекции завершилась аварийно: {}", e);
                    }
                    Ok(Flow::Continue)
                }
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return SessionEnd::Shutdown,
                Err(e) if e.is_transport() => return SessionEnd::Disconnected(e),
                Err(e) => warn!("Ошибка обработки события: {}", e),
            }
        }
    }

    async fn handle_event(&mut self, conn: &mut dyn WmConnection, event: WmEvent) -> Result<Flow> {
        self.stats.event();
        let result = match event {
            WmEvent::Window(payload) => {
                let event = payload.into_event();
                debug_if_enabled!("Событие окна {}", event);
                let identity = event.window;
                match event.event_type {
                    WindowEventType::Created => self.process_window(conn, identity).await,
                    WindowEventType::Closed => {
                        self.ledger.remove(identity.window_id);
                        Ok(())
                    }
                    // Проект окна общего процесса виден только в заголовке
                    WindowEventType::TitleChanged if self.resolver.is_shared_process(&identity) => {
                        self.process_window(conn, identity).await
                    }
                    _ => Ok(()),
                }
            }
            WmEvent::Tick(tick) if !tick.first => {
                self.handle_tick(conn, &tick.payload).await
            }
            WmEvent::Shutdown(shutdown) => {
                info!("Оконный менеджер завершается ({})", shutdown.change);
                // exit - сеанс окончен; restart - переподключаемся к новому экземпляру
                if shutdown.change == "exit" {
                    return Ok(Flow::Stop);
                }
                Err(ScopeError::Disconnected(format!("shutdown: {}", shutdown.change)))
            }
            _ => Ok(()),
        };
        result.map(|_| Flow::Continue)
    }

    async fn handle_tick(&mut self, conn: &mut dyn WmConnection, payload: &str) -> Result<()> {
        if payload == self.settings.reload_tick {
            self.reload();
            return self.reconcile(conn).await;
        }
        if let Some(command) = payload.strip_prefix(self.settings.detect_tick_prefix.as_str()) {
            self.spawn_detection(command);
        }
        Ok(())
    }

    /// Полный проход по дереву: каждое окно как новое, но без повторных меток
    async fn reconcile(&mut self, conn: &mut dyn WmConnection) -> Result<()> {
        let tree = conn.get_tree().await?;
        let windows = tree.windows();
        let present: HashSet<u64> = windows.iter().map(|w| w.window_id).collect();

        let pruned = self.ledger.retain_present(&present);
        if pruned > 0 {
            info!("Из журнала удалено {} закрытых окон", pruned);
        }

        for window in windows {
            if let Err(e) = self.process_window(conn, window).await {
                if e.is_transport() {
                    return Err(e);
                }
                warn!("{}", e);
            }
        }
        Ok(())
    }

    async fn process_window(&mut self, conn: &mut dyn WmConnection, identity: WindowIdentity) -> Result<()> {
        let env = match identity.pid {
            Some(pid) => self.environment.environment(pid),
            None => ProcessEnvironment::empty(),
        };

        let snapshot = self.store().snapshot();
        let identity = self.resolver.resolve_with(&snapshot, identity, &env);
        self.stats.resolution();

        if identity.resolution.scope == ResolvedScope::Unclassified {
            self.stats.unclassified();
            warn!(
                "Окно не классифицировано: class={:?} instance={:?} title=\"{}\", применяется {}",
                identity.window_class, identity.instance, identity.title, self.settings.default_action
            );
        }

        let active_project = self.active_project();
        let action = WindowAction::plan(&identity, self.settings.default_action, active_project.as_deref());
        let commands = action.commands(&identity.marks);

        if !commands.is_empty() {
            self.execute(conn, &commands).await?;
        }

        self.ledger.record(
            identity.window_id,
            LedgerEntry {
                class: identity.window_class.clone(),
                instance: identity.instance.clone(),
                scope: action.scope,
                mark: action.mark,
            },
        );
        Ok(())
    }

    async fn execute(&mut self, conn: &mut dyn WmConnection, commands: &[String]) -> Result<()> {
        let joined = commands.join("; ");
        if self.settings.dry_run {
            info!("[dry-run] {}", joined);
            return Ok(());
        }
        debug_if_enabled!("IPC: {}", joined);
        conn.run_command(&joined).await?;
        self.stats.commands_sent(commands.len());
        Ok(())
    }

    fn active_project(&self) -> Option<String> {
        let path = self.settings.active_project_path.as_ref()?;
        let text = std::fs::read_to_string(path).ok()?;
        let project = text.trim();
        (!project.is_empty()).then(|| project.to_string())
    }

    fn reload(&self) {
        match self.store().reload() {
            Ok(snapshot) => info!("Конфигурация классификации версии {} применена", snapshot.version),
            Err(e) => error!("Перезагрузка отклонена, остаётся прежняя конфигурация: {}", e),
        }
    }

    /// Правило из результата детекции добавляется через хранилище,
    /// как любое другое изменение конфигурации
    fn learn(&self, result: DetectionResult) {
        self.stats.detection();
        if result.is_failed() {
            warn!("Детекция не удалась: {}", result);
            return;
        }
        let Some(class) = result.detected_class.as_deref() else {
            return;
        };
        if let Some((scope, source)) = self.store().classify(class) {
            info!("Класс '{}' уже классифицирован как {} ({:?})", class, scope, source);
            return;
        }

        let scope = heuristic::guess_scope(class).unwrap_or(self.settings.default_action);
        let Some(rule) = result.suggested_rule(scope) else {
            return;
        };
        match self.store().add_pattern(rule.clone()) {
            Ok(_) => info!("Добавлено правило {}", rule),
            Err(e) => error!("Не удалось добавить правило {}: {}", rule, e),
        }
    }

    fn spawn_detection(&mut self, command: &str) {
        let Some(service) = self.detection.clone() else {
            warn!("Детекция недоступна в этом режиме, запрос '{}' пропущен", command);
            return;
        };
        let spec = match LaunchSpec::parse(command) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Некорректная команда детекции '{}': {}", command, e);
                return;
            }
        };

        let timeout = self.settings.detect_timeout;
        let tx = self.commands_tx.clone();
        info!("Фоновая детекция '{}'", spec);
        self.detections.spawn(async move {
            let result = service.detect(&spec, DetectRequest::new(timeout)).await;
            if tx.send(DaemonCommand::Learn(result)).await.is_err() {
                warn!("Демон остановлен до завершения детекции '{}'", spec);
            }
        });
    }

    async fn stop(mut self) -> StatsSnapshot {
        // Отмена незавершённых детекций: их guard убивает процессы при drop
        self.detections.shutdown().await;
        self.set_state(DaemonState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            "EventDaemon остановлен: событий {}, разрешений {}, команд {}, неклассифицировано {}, переподключений {}",
            stats.events, stats.resolutions, stats.commands, stats.unclassified, stats.reconnects
        );
        stats
    }
}
