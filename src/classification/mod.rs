//! Классификация окон: правила, их компиляция и владелец конфигурации.

pub mod cache;
pub mod config;
pub mod matcher;
pub mod pattern;
pub mod store;

pub use config::{ClassificationConfig, ValidationReport};
pub use matcher::PatternMatcher;
pub use pattern::{PatternRule, Scope};
pub use store::{ClassificationStore, Snapshot};
