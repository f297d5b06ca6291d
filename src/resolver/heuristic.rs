use crate::classification::Scope;
use once_cell::sync::Lazy;

/// Категория приложения, угаданная по ключевым словам
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Terminal,
    Editor,
    Ide,
    FileManager,
    Browser,
    Chat,
    Media,
    System,
}

impl Category {
    pub fn scope(&self) -> Scope {
        match self {
            Category::Terminal | Category::Editor | Category::Ide | Category::FileManager => {
                Scope::Scoped
            }
            Category::Browser | Category::Chat | Category::Media | Category::System => Scope::Global,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guess {
    pub category: Category,
    pub scope: Scope,
    pub confidence: f32,
}

const CLASS_CONFIDENCE: f32 = 0.6;
const TITLE_CONFIDENCE: f32 = 0.4;

static KEYWORDS: Lazy<Vec<(Category, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        (
            Category::Terminal,
            &["term", "alacritty", "kitty", "foot", "wezterm", "ghostty", "konsole", "tmux"][..],
        ),
        (Category::Ide, &["code", "idea", "jetbrains", "clion", "pycharm", "zed"][..]),
        (Category::Editor, &["vim", "emacs", "gedit", "kate", "helix", "editor"][..]),
        (Category::FileManager, &["nautilus", "dolphin", "thunar", "nemo", "yazi", "files"][..]),
        (
            Category::Browser,
            &["firefox", "chrom", "brave", "vivaldi", "qutebrowser", "browser"][..],
        ),
        (
            Category::Chat,
            &["slack", "discord", "telegram", "signal", "element", "teams"][..],
        ),
        (Category::Media, &["spotify", "mpv", "vlc", "music", "player"][..]),
        (
            Category::System,
            &["pavucontrol", "settings", "blueman", "nm-connection", "polkit"][..],
        ),
    ]
});

/// Эвристическая догадка по классу, затем по заголовку.
/// Порядок таблицы задаёт приоритет категорий.
pub fn guess(class: Option<&str>, title: &str) -> Option<Guess> {
    if let Some(class) = class {
        let class_lower = class.to_lowercase();
        if let Some(category) = lookup(&class_lower) {
            return Some(Guess {
                category,
                scope: category.scope(),
                confidence: CLASS_CONFIDENCE,
            });
        }
    }

    let title_lower = title.to_lowercase();
    lookup(&title_lower).map(|category| Guess {
        category,
        scope: category.scope(),
        confidence: TITLE_CONFIDENCE,
    })
}

/// Только по имени класса: удобно как эвристика для ClassificationStore::is_scoped
pub fn guess_scope(class: &str) -> Option<Scope> {
    guess(Some(class), "").map(|g| g.scope)
}

fn lookup(text: &str) -> Option<Category> {
    if text.is_empty() {
        return None;
    }
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|word| text.contains(word)))
        .map(|(category, _)| *category)
}
