use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Пул номеров виртуальных дисплеев `[base, base + size)`.
/// Номер принадлежит одной детекции, пока жива её аренда.
#[derive(Debug)]
pub struct DisplayAllocator {
    base: u32,
    size: u32,
    leased: Arc<Mutex<HashSet<u32>>>,
}

impl DisplayAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Первый свободный номер, для которого `is_taken` ложно
    /// (например, нет чужого lock-файла X-сервера)
    pub fn acquire<F>(&self, is_taken: F) -> Option<DisplayLease>
    where
        F: Fn(u32) -> bool,
    {
        let mut leased = self.leased.lock();
        let number = (self.base..self.base.saturating_add(self.size))
            .find(|n| !leased.contains(n) && !is_taken(*n))?;
        leased.insert(number);
        Some(DisplayLease {
            number,
            leased: Arc::clone(&self.leased),
        })
    }

    pub fn in_use(&self) -> usize {
        self.leased.lock().len()
    }
}

/// Аренда номера дисплея; номер возвращается в пул при drop
#[derive(Debug)]
pub struct DisplayLease {
    number: u32,
    leased: Arc<Mutex<HashSet<u32>>>,
}

impl DisplayLease {
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Значение переменной DISPLAY
    pub fn display_name(&self) -> String {
        format!(":{}", self.number)
    }
}

impl Drop for DisplayLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.number);
    }
}

pub fn lock_file(display: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X{}-lock", display))
}

pub fn socket_file(display: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X11-unix/X{}", display))
}
