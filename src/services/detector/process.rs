use crate::error::Result;
use crate::scope_error;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Процесс, которым владеет детекция (X-сервер или приложение)
#[async_trait]
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// `Some(success)`, если процесс уже завершился
    fn poll_exit(&mut self) -> Option<bool>;

    /// Мягкое завершение (SIGTERM группе процессов)
    fn terminate(&mut self);

    /// Немедленное завершение (SIGKILL группе). Синхронно, вызывается и из Drop.
    fn force_kill(&mut self);

    /// Ждёт завершения не дольше `timeout`; true, если процесс завершился
    async fn wait_exit(&mut self, timeout: Duration) -> bool;

    fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }
}

/// Дочерний процесс, запущенный лидером собственной группы процессов
pub struct ChildProcess {
    name: String,
    child: Child,
    pgid: Option<i32>,
}

impl ChildProcess {
    /// `child` должен быть запущен с `process_group(0)`
    pub fn new(name: impl Into<String>, child: Child) -> Self {
        let pgid = child.id().map(|pid| pid as i32);
        Self {
            name: name.into(),
            child,
            pgid,
        }
    }

    fn signal_group(&self, signal: libc::c_int) {
        let Some(pgid) = self.pgid else {
            return;
        };
        // Отрицательный pid адресует всю группу: потомки приложения тоже получают сигнал
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("kill(-{}, {}) для {}: {}", pgid, signal, self.name, err);
            }
        }
    }
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pgid.map(|pid| pid as u32)
    }

    fn poll_exit(&mut self) -> Option<bool> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.success()),
            Ok(None) => None,
            Err(e) => {
                debug!("try_wait для {}: {}", self.name, e);
                Some(false)
            }
        }
    }

    fn terminate(&mut self) {
        self.signal_group(libc::SIGTERM);
    }

    fn force_kill(&mut self) {
        self.signal_group(libc::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            debug!("start_kill для {}: {}", self.name, e);
        }
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.child.wait()).await, Ok(Ok(_)))
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.signal_group(libc::SIGKILL);
        }
    }
}

/// SIGTERM, ожидание `grace`, затем SIGKILL. Ошибка, если процесс пережил и SIGKILL.
pub async fn shutdown_process(process: &mut dyn ManagedProcess, name: &str, grace: Duration) -> Result<()> {
    if !process.is_running() {
        // Группа могла пережить лидера (форкнутые потомки приложения)
        process.force_kill();
        return Ok(());
    }

    process.terminate();
    if process.wait_exit(grace).await {
        debug!("{} завершён по SIGTERM", name);
        process.force_kill();
        return Ok(());
    }

    warn!("{} не завершился за {:?}, отправляем SIGKILL", name, grace);
    process.force_kill();
    if process.wait_exit(grace).await {
        return Ok(());
    }

    Err(scope_error!(process, "{} (pid {:?}) не завершился после SIGKILL", name, process.pid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn(script: &str) -> ChildProcess {
        let child = Command::new("sh")
            .args(["-c", script])
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ChildProcess::new("sh", child)
    }

    #[tokio::test]
    async fn test_sigterm_stops_cooperative_process() {
        let mut process = spawn("sleep 30");
        assert!(process.is_running());
        shutdown_process(&mut process, "sleep", Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_sigkill_after_grace() {
        let mut process = spawn("trap '' TERM; while true; do sleep 0.1; done");
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_process(&mut process, "stubborn", Duration::from_millis(300)).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_exited_process_is_noop() {
        let mut process = spawn("exit 3");
        assert!(process.wait_exit(Duration::from_secs(2)).await);
        assert_eq!(process.poll_exit(), Some(false));
        shutdown_process(&mut process, "done", Duration::from_millis(100)).await.unwrap();
    }
}
