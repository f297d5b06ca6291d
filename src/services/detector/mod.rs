//! Определение класса окна для приложений, которые ещё не встречались.
//!
//! `IsolatedDetector` запускает приложение на отдельном дисплее Xvfb,
//! ждёт первое окно и читает `WM_CLASS`. При любом исходе запущенные
//! процессы завершаются, а файлы нашего дисплея удаляются.
//! `DetectionService` добавляет кэш и более дешёвые способы поверх.

pub mod backend;
pub mod cache;
pub mod display;
pub mod isolated;
pub mod launch;
pub mod process;
pub mod result;
pub mod service;
pub mod state;

pub use isolated::IsolatedDetector;
pub use launch::LaunchSpec;
pub use result::{DetectionMethod, DetectionResult};
pub use service::{DetectRequest, DetectionService};
