use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Ошибка конфигурации ({field}): {message}")]
    Config { field: String, message: String },

    #[error("Некорректный паттерн '{pattern}': {message}")]
    Pattern {
        pattern: String,
        message: String,
        position: Option<usize>,
    },

    #[error("Класс '{0}' одновременно указан в scoped_classes и global_classes")]
    Conflict(String),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ошибка IPC: {0}")]
    Ipc(String),

    #[error("Соединение с оконным менеджером потеряно: {0}")]
    Disconnected(String),

    #[error("Зависимость недоступна: {0}")]
    DependencyMissing(String),

    #[error("Таймаут: {0}")]
    Timeout(String),

    #[error("Ошибка процесса: {0}")]
    Process(String),

    #[error("Внутренняя ошибка: {0}")]
    Internal(String),
}

impl ScopeError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        ScopeError::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Ошибки, которые отклоняются до любого изменения сохранённого состояния
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ScopeError::Config { .. } | ScopeError::Pattern { .. } | ScopeError::Conflict(_)
        )
    }

    /// Ошибки транспорта IPC: демон переподключается, а не завершается
    pub fn is_transport(&self) -> bool {
        matches!(self, ScopeError::Disconnected(_) | ScopeError::Io(_))
    }

    /// Код выхода CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_validation() => 2,
            ScopeError::Json(_) => 2,
            ScopeError::DependencyMissing(_) => 3,
            ScopeError::Disconnected(_) | ScopeError::Ipc(_) => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;

// Удобные макросы для создания ошибок
#[macro_export]
macro_rules! scope_error {
    (ipc, $($arg:tt)*) => {
        $crate::error::ScopeError::Ipc(format!($($arg)*))
    };
    (disconnected, $($arg:tt)*) => {
        $crate::error::ScopeError::Disconnected(format!($($arg)*))
    };
    (dependency, $($arg:tt)*) => {
        $crate::error::ScopeError::DependencyMissing(format!($($arg)*))
    };
    (timeout, $($arg:tt)*) => {
        $crate::error::ScopeError::Timeout(format!($($arg)*))
    };
    (process, $($arg:tt)*) => {
        $crate::error::ScopeError::Process(format!($($arg)*))
    };
    (internal, $($arg:tt)*) => {
        $crate::error::ScopeError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ScopeError::Conflict("Code".into()).exit_code(), 2);
        assert_eq!(ScopeError::config("scoped_classes[0]", "пусто").exit_code(), 2);
        assert_eq!(scope_error!(dependency, "Xvfb").exit_code(), 3);
        assert_eq!(scope_error!(disconnected, "eof").exit_code(), 4);
        assert_eq!(scope_error!(internal, "x").exit_code(), 1);
    }

    #[test]
    fn test_transport_classification() {
        assert!(scope_error!(disconnected, "eof").is_transport());
        assert!(!scope_error!(timeout, "10s").is_transport());
    }
}
