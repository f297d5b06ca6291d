use crate::config::DetectionConfig;
use crate::error::{Result, ScopeError};
use crate::scope_error;
use crate::utils::dependencies::check_detection_dependencies;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use super::display::{lock_file, socket_file};
use super::launch::LaunchSpec;
use super::process::{ChildProcess, ManagedProcess};

/// Класс и instance найденного окна (WM_CLASS)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClass {
    pub class: String,
    pub instance: Option<String>,
}

/// Виртуальный дисплей и запросы к нему
#[async_trait]
pub trait DisplayBackend: Send + Sync {
    /// Все ли внешние утилиты доступны
    fn check_dependencies(&self) -> Result<()>;

    /// Занят ли номер дисплея кем-то вне пула
    fn display_in_use(&self, display: u32) -> bool;

    async fn start_display(&self, display: u32) -> Result<Box<dyn ManagedProcess>>;

    /// Ждёт готовности дисплея, запущенного как `server`. Ошибка, если
    /// сервер завершился раньше: сокет в этом случае принадлежит чужому X.
    async fn wait_ready(
        &self,
        display: u32,
        server: &mut dyn ManagedProcess,
        timeout: Duration,
    ) -> Result<()>;

    async fn launch_app(&self, spec: &LaunchSpec, display: u32) -> Result<Box<dyn ManagedProcess>>;

    /// Окно процесса `pid` (или любое окно с классом), если оно уже появилось
    async fn probe_window(&self, display: u32, pid: Option<u32>) -> Result<Option<WindowClass>>;

    /// Удаляет lock- и socket-файлы, оставленные нашим X-сервером
    fn cleanup_artifacts(&self, display: u32);
}

/// Xvfb + xdotool + xprop
pub struct XvfbBackend {
    config: DetectionConfig,
}

impl XvfbBackend {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    fn spawn_error(binary: &str, e: std::io::Error) -> ScopeError {
        if e.kind() == ErrorKind::NotFound {
            scope_error!(dependency, "{} не найден", binary)
        } else {
            scope_error!(process, "не удалось запустить {}: {}", binary, e)
        }
    }

    async fn query(&self, display: u32, binary: &str, args: &[&str]) -> Result<Option<String>> {
        let output = Command::new(binary)
            .args(args)
            .env("DISPLAY", format!(":{}", display))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Self::spawn_error(binary, e))?;

        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!stdout.is_empty()).then_some(stdout))
    }

    async fn window_class(&self, display: u32, window_id: &str) -> Result<Option<WindowClass>> {
        let output = self
            .query(display, &self.config.xprop_binary, &["-id", window_id, "WM_CLASS"])
            .await?;
        Ok(output.as_deref().and_then(parse_wm_class))
    }

    async fn find_window(&self, display: u32, pid: Option<u32>) -> Result<Option<String>> {
        let probe = self.config.probe_binary.as_str();
        if let Some(pid) = pid {
            let pid = pid.to_string();
            if let Some(ids) = self.query(display, probe, &["search", "--pid", &pid]).await? {
                return Ok(ids.lines().next().map(str::to_string));
            }
        }

        // Приложения, которые форкаются при старте, владеют окном под другим pid.
        // На изолированном дисплее нет чужих окон, поэтому подходит любое видимое с классом.
        let ids = self
            .query(display, probe, &["search", "--onlyvisible", "--class", "."])
            .await?;
        Ok(ids.and_then(|ids| ids.lines().next().map(str::to_string)))
    }
}

#[async_trait]
impl DisplayBackend for XvfbBackend {
    fn check_dependencies(&self) -> Result<()> {
        check_detection_dependencies(&self.config).into_result()
    }

    fn display_in_use(&self, display: u32) -> bool {
        lock_file(display).exists() || socket_file(display).exists()
    }

    async fn start_display(&self, display: u32) -> Result<Box<dyn ManagedProcess>> {
        let binary = &self.config.xvfb_binary;
        let child = Command::new(binary)
            .arg(format!(":{}", display))
            .args(["-screen", "0", "1024x768x24", "-nolisten", "tcp"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::spawn_error(binary, e))?;

        let display_num = display;
        debug!("{} :{} запущен (pid {:?})", binary, display_num, child.id());
        Ok(Box::new(ChildProcess::new(format!("{} :{}", binary, display), child)))
    }

    async fn wait_ready(
        &self,
        display: u32,
        server: &mut dyn ManagedProcess,
        timeout: Duration,
    ) -> Result<()> {
        let socket = socket_file(display);
        let started = Instant::now();
        while started.elapsed() < timeout {
            // Проиграв гонку за номер дисплея, Xvfb сразу завершается,
            // а сокет на месте остаётся от победителя
            if server.poll_exit().is_some() {
                return Err(scope_error!(
                    process,
                    "X-сервер :{} завершился до готовности (дисплей занят?)",
                    display
                ));
            }
            if socket.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Err(scope_error!(
            timeout,
            "виртуальный дисплей :{} не готов за {:?}",
            display,
            timeout
        ))
    }

    async fn launch_app(&self, spec: &LaunchSpec, display: u32) -> Result<Box<dyn ManagedProcess>> {
        let child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .env("DISPLAY", format!(":{}", display))
            .env_remove("WAYLAND_DISPLAY")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| scope_error!(process, "не удалось запустить '{}': {}", spec.command, e))?;

        Ok(Box::new(ChildProcess::new(spec.basename().to_string(), child)))
    }

    async fn probe_window(&self, display: u32, pid: Option<u32>) -> Result<Option<WindowClass>> {
        match self.find_window(display, pid).await? {
            Some(window_id) => self.window_class(display, &window_id).await,
            None => Ok(None),
        }
    }

    fn cleanup_artifacts(&self, display: u32) {
        for path in [lock_file(display), socket_file(display)] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Удалён {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!("Не удалось удалить {:?}: {}", path, e),
            }
        }
    }
}

/// `WM_CLASS(STRING) = "code", "Code"` -> instance `code`, class `Code`
pub fn parse_wm_class(output: &str) -> Option<WindowClass> {
    let (_, values) = output.split_once('=')?;
    let parts: Vec<&str> = values
        .split(',')
        .map(|part| part.trim().trim_matches('"'))
        .filter(|part| !part.is_empty())
        .collect();

    match parts.as_slice() {
        [instance, class, ..] => Some(WindowClass {
            class: class.to_string(),
            instance: Some(instance.to_string()),
        }),
        [class] => Some(WindowClass {
            class: class.to_string(),
            instance: None,
        }),
        [] => None,
    }
}
