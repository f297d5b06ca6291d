use std::fmt;

/// Состояния одной детекции:
/// `Idle -> DisplayStarting -> AppLaunching -> Polling -> {Found|TimedOut|LaunchFailed} -> Terminating -> Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    DisplayStarting,
    AppLaunching,
    Polling,
    Found,
    TimedOut,
    LaunchFailed,
    Terminating,
    Done,
}

impl DetectionState {
    /// Допустим ли переход. Таймаут и отмена возможны из любого рабочего
    /// состояния, очистка достижима из любого состояния, кроме Done.
    pub fn can_advance_to(self, next: DetectionState) -> bool {
        use DetectionState::*;
        match (self, next) {
            (Idle, DisplayStarting) => true,
            (DisplayStarting, AppLaunching) => true,
            (AppLaunching, Polling) => true,
            (Polling, Found) => true,
            (DisplayStarting | AppLaunching | Polling, TimedOut | LaunchFailed) => true,
            (Done, _) => false,
            (_, Terminating) => self != Terminating,
            (Terminating, Done) => true,
            _ => false,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            DetectionState::DisplayStarting | DetectionState::AppLaunching | DetectionState::Polling
        )
    }
}

impl fmt::Display for DetectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::DetectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Idle, DisplayStarting, AppLaunching, Polling, Found, Terminating, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_cleanup_reachable_from_any_state() {
        for state in [Idle, DisplayStarting, AppLaunching, Polling, Found, TimedOut, LaunchFailed] {
            assert!(state.can_advance_to(Terminating));
        }
        assert!(!Done.can_advance_to(Terminating));
        assert!(!Polling.can_advance_to(Done));
        assert!(!Found.can_advance_to(Polling));
    }
}
