use crate::classification::Scope;
use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

/// Запись внешнего реестра приложений
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppEntry {
    pub name: String,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub preferred_workspace: Option<String>,
    #[serde(default)]
    pub expected_class: Option<String>,
}

/// Реестр приложений: имя из `SCOPEWM_APP_NAME` -> предпочтительная область
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    entries: HashMap<String, AppEntry>,
}

impl AppRegistry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<AppEntry> = serde_json::from_str(&text).map_err(|e| {
            ScopeError::config(
                format!("{}: строка {}, столбец {}", path.display(), e.line(), e.column()),
                e.to_string(),
            )
        })?;

        info!("Реестр приложений: {} записей из {:?}", entries.len(), path);
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AppEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AppEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
