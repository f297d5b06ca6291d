use crate::debug_if_enabled;
use crate::error::Result;
use parking_lot::Mutex;
use regex::Regex;
use tracing::warn;

use super::cache::{MatchCache, DEFAULT_CACHE_CAPACITY};
use super::pattern::{PatternKind, PatternRule, Scope};

/// Скомпилированная форма правила. Разбор текста происходит один раз при компиляции.
#[derive(Debug, Clone)]
enum Matchable {
    Literal(String),
    Glob(Regex),
    Regex(Regex),
}

impl Matchable {
    fn is_match(&self, class: &str) -> bool {
        match self {
            Matchable::Literal(text) => text == class,
            Matchable::Glob(re) | Matchable::Regex(re) => re.is_match(class),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: PatternRule,
    matcher: Matchable,
}

/// Вычислитель правил: приоритет по убыванию, при равенстве выигрывает
/// правило, добавленное раньше. Первое совпадение завершает поиск.
#[derive(Debug)]
pub struct PatternMatcher {
    rules: Vec<CompiledRule>,
    cache: Mutex<MatchCache>,
    warnings: Vec<String>,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            cache: Mutex::new(MatchCache::new(DEFAULT_CACHE_CAPACITY)),
            warnings: Vec::new(),
        }
    }
}

impl PatternMatcher {
    pub fn compile(rules: &[PatternRule]) -> Result<Self> {
        Self::compile_with_capacity(rules, DEFAULT_CACHE_CAPACITY)
    }

    /// Каждая компиляция создаёт новый пустой кэш, поэтому перезагрузка
    /// конфигурации всегда сбрасывает мемоизацию целиком.
    pub fn compile_with_capacity(rules: &[PatternRule], cache_capacity: usize) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let matcher = match rule.kind() {
                PatternKind::Literal => Matchable::Literal(rule.body().to_string()),
                PatternKind::Glob => match rule.compile_regex()? {
                    Some(re) => Matchable::Glob(re),
                    None => Matchable::Literal(rule.body().to_string()),
                },
                PatternKind::Regex => match rule.compile_regex()? {
                    Some(re) => Matchable::Regex(re),
                    None => Matchable::Literal(rule.body().to_string()),
                },
            };
            compiled.push(CompiledRule {
                rule: rule.clone(),
                matcher,
            });
        }

        // sort_by стабилен: при равном приоритете сохраняется порядок добавления
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        let warnings = analyze_overlaps(&compiled);
        for warning in &warnings {
            warn!("{}", warning);
        }

        Ok(Self {
            rules: compiled,
            cache: Mutex::new(MatchCache::new(cache_capacity)),
            warnings,
        })
    }

    /// Область для класса окна или None, если ни одно правило не совпало
    pub fn match_class(&self, window_class: &str) -> Option<Scope> {
        if let Some(cached) = self.cache.lock().get(window_class) {
            return cached;
        }

        let result = self.explain(window_class).map(|rule| rule.scope);
        debug_if_enabled!("PatternMatcher: '{}' -> {:?}", window_class, result);
        self.cache.lock().insert(window_class, result);
        result
    }

    /// Правило, которое решает судьбу класса (без кэша)
    pub fn explain(&self, window_class: &str) -> Option<&PatternRule> {
        self.rules
            .iter()
            .find(|compiled| compiled.matcher.is_match(window_class))
            .map(|compiled| &compiled.rule)
    }

    /// Правила в порядке вычисления
    pub fn rules(&self) -> impl Iterator<Item = &PatternRule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.lock().stats()
    }
}

/// Предупреждения о дубликатах `(pattern, priority)` и о пересекающихся
/// правилах с одинаковым приоритетом. Пересечение проверяется на
/// строках-свидетелях, построенных из тела каждого правила.
fn analyze_overlaps(rules: &[CompiledRule]) -> Vec<String> {
    let mut warnings = Vec::new();

    for (i, first) in rules.iter().enumerate() {
        for second in rules.iter().skip(i + 1) {
            if first.rule.priority != second.rule.priority {
                // Правила отсортированы, дальше приоритеты только меньше
                break;
            }

            if first.rule.pattern == second.rule.pattern {
                warnings.push(format!(
                    "Дублирующееся правило '{}' с приоритетом {}",
                    first.rule.pattern, first.rule.priority
                ));
                continue;
            }

            let overlap = witnesses(&first.rule)
                .iter()
                .any(|w| second.matcher.is_match(w))
                || witnesses(&second.rule)
                    .iter()
                    .any(|w| first.matcher.is_match(w));

            if overlap && first.rule.scope != second.rule.scope {
                warnings.push(format!(
                    "Правила '{}' и '{}' с приоритетом {} пересекаются; побеждает '{}' (добавлено раньше)",
                    first.rule.pattern, second.rule.pattern, first.rule.priority, first.rule.pattern
                ));
            }
        }
    }

    warnings
}

fn witnesses(rule: &PatternRule) -> Vec<String> {
    let body = rule.body();
    match rule.kind() {
        PatternKind::Literal => vec![body.to_string()],
        PatternKind::Glob => {
            let mut plain = String::new();
            let mut in_class = false;
            for c in body.chars() {
                match c {
                    '[' => in_class = true,
                    ']' => in_class = false,
                    '*' if !in_class => {}
                    '?' if !in_class => plain.push('x'),
                    _ if !in_class => plain.push(c),
                    _ => {}
                }
            }
            vec![plain]
        }
        PatternKind::Regex => {
            // Для regex берём только литеральные фрагменты
            let literal: String = body
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
                .collect();
            vec![literal]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, scope: Scope, priority: u32) -> PatternRule {
        PatternRule::new(pattern, scope, priority).unwrap()
    }

    /// Эталон: линейный просмотр неподготовленных правил
    fn oracle(rules: &[PatternRule], class: &str) -> Option<Scope> {
        let mut sorted: Vec<&PatternRule> = rules.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        sorted
            .into_iter()
            .find(|r| {
                let (kind, body) = PatternKind::split(&r.pattern);
                match kind {
                    PatternKind::Literal => body == class,
                    _ => r.compile_regex().unwrap().unwrap().is_match(class),
                }
            })
            .map(|r| r.scope)
    }

    #[test]
    fn test_glob_scenario() {
        let matcher = PatternMatcher::compile(&[rule("glob:pwa-*", Scope::Global, 100)]).unwrap();
        assert_eq!(matcher.match_class("pwa-youtube"), Some(Scope::Global));
        assert_eq!(matcher.match_class("firefox"), None);
    }

    #[test]
    fn test_priority_tie_break_first_added_wins() {
        let matcher = PatternMatcher::compile(&[
            rule("glob:terminal-*", Scope::Scoped, 50),
            rule("terminal-special", Scope::Global, 50),
        ])
        .unwrap();

        assert_eq!(matcher.match_class("terminal-special"), Some(Scope::Scoped));
        assert_eq!(matcher.warnings().len(), 1);
    }

    #[test]
    fn test_unprefixed_star_is_literal() {
        let matcher = PatternMatcher::compile(&[
            rule("terminal-*", Scope::Scoped, 50),
            rule("terminal-special", Scope::Global, 50),
        ])
        .unwrap();

        // Без префикса glob: звёздочка не подстановка
        assert_eq!(matcher.match_class("terminal-special"), Some(Scope::Global));
        assert_eq!(matcher.match_class("terminal-*"), Some(Scope::Scoped));
        assert_eq!(matcher.match_class("terminal-other"), None);
    }

    #[test]
    fn test_higher_priority_evaluated_first() {
        let matcher = PatternMatcher::compile(&[
            rule("glob:*", Scope::Scoped, 1),
            rule("regex:^(firefox|chromium)$", Scope::Global, 90),
        ])
        .unwrap();

        assert_eq!(matcher.match_class("firefox"), Some(Scope::Global));
        assert_eq!(matcher.match_class("Alacritty"), Some(Scope::Scoped));
        assert_eq!(matcher.explain("chromium").unwrap().priority, 90);
    }

    #[test]
    fn test_matches_oracle_and_is_deterministic() {
        let rules = vec![
            rule("glob:pwa-*", Scope::Global, 100),
            rule("Code", Scope::Scoped, 80),
            rule("regex:^org\\.gnome\\.", Scope::Global, 80),
            rule("glob:*term*", Scope::Scoped, 10),
            rule("glob:Code*", Scope::Global, 5),
        ];
        let matcher = PatternMatcher::compile(&rules).unwrap();
        let inputs = [
            "pwa-youtube",
            "Code",
            "Code-insiders",
            "org.gnome.Nautilus",
            "xterm",
            "gnome-terminal",
            "",
            "firefox",
        ];

        for input in inputs {
            let first = matcher.match_class(input);
            let second = matcher.match_class(input);
            assert_eq!(first, second, "повторный вызов для '{input}'");
            assert_eq!(first, oracle(&rules, input), "расхождение с эталоном для '{input}'");
        }

        let (hits, misses) = matcher.cache_stats();
        assert_eq!(misses, inputs.len() as u64);
        assert_eq!(hits, inputs.len() as u64);
    }

    #[test]
    fn test_recompile_is_idempotent() {
        let rules = vec![rule("glob:pwa-*", Scope::Global, 100), rule("Code", Scope::Scoped, 1)];
        let a = PatternMatcher::compile(&rules).unwrap();
        let b = PatternMatcher::compile(&rules).unwrap();
        for input in ["pwa-x", "Code", "other"] {
            assert_eq!(a.match_class(input), b.match_class(input));
        }
    }

    #[test]
    fn test_invalid_regex_fails_compile() {
        let bad = PatternRule {
            pattern: "regex:[unclosed".to_string(),
            scope: Scope::Global,
            priority: 1,
            description: None,
        };
        assert!(PatternMatcher::compile(&[bad]).is_err());
    }

    #[test]
    fn test_duplicate_pattern_priority_warns() {
        let matcher = PatternMatcher::compile(&[
            rule("Code", Scope::Scoped, 10),
            rule("Code", Scope::Scoped, 10),
        ])
        .unwrap();
        assert_eq!(matcher.warnings().len(), 1);
        assert!(matcher.warnings()[0].contains("Дублирующееся"));
    }
}
