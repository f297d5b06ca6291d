//! Обработчики подкоманд. Результаты печатаются в stdout (текст или JSON),
//! диагностика идёт через tracing в stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::classification::{ClassificationConfig, ClassificationStore, PatternRule, Scope};
use crate::config::Config;
use crate::resolver::{heuristic, AppRegistry, ProcfsEnvironment, WindowIdentityResolver};
use crate::services::detector::cache::DetectionCache;
use crate::services::detector::{DetectionResult, LaunchSpec};
use crate::services::ipc::WmConnection;
use crate::services::{DaemonSettings, DetectRequest, DetectionService, EventDaemon, SwayConnector, WmConnector};
use crate::utils::dependencies::check_detection_dependencies;
use crate::DetectArgs;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn open_store(config: &Config) -> Result<Arc<ClassificationStore>> {
    let settings = &config.classification;
    let store = ClassificationStore::open_with(
        &settings.path,
        settings.unclassified_policy,
        settings.match_cache_capacity,
    )
    .with_context(|| format!("Не удалось открыть {:?}", settings.path))?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_daemon(config: Config, dry_run: bool) -> Result<()> {
    let store = open_store(&config)?;
    let registry = AppRegistry::load(&config.classification.registry_path)
        .with_context(|| format!("Не удалось загрузить {:?}", config.classification.registry_path))?;
    let resolver = WindowIdentityResolver::new(store, Arc::new(registry))
        .with_shared_process_classes(config.classification.shared_process_classes.clone())
        .with_title_rules(config.title_rules()?);

    let connector = Arc::new(
        SwayConnector::new(config.ipc.socket_path.clone())
            .with_request_timeout(config.ipc.request_timeout()),
    );
    let mut daemon = EventDaemon::new(
        connector,
        Arc::new(resolver),
        Arc::new(ProcfsEnvironment::new()),
        DaemonSettings::from_config(&config, dry_run),
    );

    match DetectionService::from_config(&config.detection) {
        Ok(service) => daemon = daemon.with_detection(service),
        Err(e) => warn!("Фоновая детекция отключена: {}", e),
    }

    let handle = daemon.handle();
    let mut task = tokio::spawn(daemon.run());

    tokio::select! {
        joined = &mut task => {
            joined.context("Задача демона завершилась аварийно")?;
            return Ok(());
        }
        _ = shutdown_signal() => info!("Получен сигнал завершения"),
    }

    if let Err(e) = handle.shutdown().await {
        warn!("{}", e);
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
        Ok(joined) => {
            joined.context("Задача демона завершилась аварийно")?;
        }
        Err(_) => {
            warn!("Таймаут при остановке демона");
            task.abort();
        }
    }
    info!("scopewm завершил работу");
    Ok(())
}

/// Ctrl+C или SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Не удалось подписаться на SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

pub fn pattern_add(
    config: &Config,
    pattern: String,
    scope: Scope,
    priority: u32,
    description: Option<String>,
    json: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let mut rule = PatternRule::new(pattern, scope, priority)?;
    if let Some(description) = description {
        rule = rule.with_description(description);
    }

    let report = store.add_pattern(rule.clone())?;
    let warnings: Vec<String> = report.warnings().map(|w| w.message.clone()).collect();
    if json {
        return print_json(&json!({ "added": rule, "warnings": warnings }));
    }
    println!("Добавлено: {}", rule);
    for warning in warnings {
        println!("  предупреждение: {}", warning);
    }
    Ok(())
}

pub fn pattern_remove(config: &Config, pattern: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let removed = store.remove_pattern(pattern)?;
    if json {
        return print_json(&json!({ "pattern": pattern, "removed": removed }));
    }
    println!("Удалено правил: {}", removed);
    Ok(())
}

pub fn pattern_list(config: &Config, json: bool) -> Result<()> {
    let snapshot = open_store(config)?.snapshot();
    if json {
        return print_json(&snapshot.config.patterns);
    }
    if snapshot.config.patterns.is_empty() {
        println!("Правил нет");
    }
    for rule in &snapshot.config.patterns {
        println!("{}", rule);
    }
    Ok(())
}

pub fn pattern_test(config: &Config, class: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = store.snapshot();

    let explicit = snapshot.config.explicit_scope(class);
    let rule = snapshot.matcher.explain(class).cloned();
    let guess = heuristic::guess_scope(class);
    let guesser = |c: &str| heuristic::guess_scope(c);
    let scoped = store.is_scoped(class, Some(&guesser));

    if json {
        return print_json(&json!({
            "class": class,
            "explicit": explicit,
            "rule": rule,
            "heuristic": guess,
            "scope": if scoped { Scope::Scoped } else { Scope::Global },
        }));
    }

    match (explicit, &rule, guess) {
        (Some(scope), _, _) => println!("{}: {} (явный список)", class, scope),
        (None, Some(rule), _) => println!("{}: {} (правило {})", class, rule.scope, rule),
        (None, None, Some(scope)) => println!("{}: {} (эвристика)", class, scope),
        (None, None, None) => println!(
            "{}: не классифицирован, политика {}",
            class, config.classification.unclassified_policy
        ),
    }
    Ok(())
}

pub fn class_add(config: &Config, class: &str, scope: Scope, json: bool) -> Result<()> {
    open_store(config)?.add_class(class, scope)?;
    if json {
        return print_json(&json!({ "class": class, "scope": scope }));
    }
    println!("{} -> {}", class, scope);
    Ok(())
}

pub fn class_remove(config: &Config, class: &str, json: bool) -> Result<()> {
    open_store(config)?.remove_class(class)?;
    if json {
        return print_json(&json!({ "class": class, "removed": true }));
    }
    println!("Удалён класс {}", class);
    Ok(())
}

pub fn class_list(config: &Config, json: bool) -> Result<()> {
    let classes = open_store(config)?.config();
    if json {
        return print_json(&json!({
            "scoped_classes": classes.scoped_classes,
            "global_classes": classes.global_classes,
        }));
    }
    println!("scoped: {}", classes.scoped_classes.join(", "));
    println!("global: {}", classes.global_classes.join(", "));
    Ok(())
}

fn launch_specs(args: &DetectArgs) -> Result<Vec<LaunchSpec>> {
    if let Some(batch) = &args.batch {
        let text = fs::read_to_string(batch).with_context(|| format!("Не удалось прочитать {:?}", batch))?;
        return text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| LaunchSpec::parse(line).map_err(Into::into))
            .collect();
    }

    let (command, rest) = args
        .command
        .split_first()
        .context("Не указана команда для детекции")?;
    let mut spec = LaunchSpec::new(command.clone()).with_args(rest.iter().cloned());
    if let Some(desktop) = &args.desktop_file {
        spec = spec.with_desktop_file(desktop.clone());
    }
    Ok(vec![spec])
}

pub async fn detect(config: &Config, args: DetectArgs, json: bool) -> Result<()> {
    let specs = launch_specs(&args)?;
    let service = DetectionService::from_config(&config.detection)?;
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.detection.timeout());

    // Ctrl+C отменяет все запущенные детекции, процессы при этом убираются
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let mut tasks = JoinSet::new();
    for (index, spec) in specs.into_iter().enumerate() {
        let service = Arc::clone(&service);
        let request = DetectRequest {
            timeout,
            use_cache: !args.no_cache,
            cancel: Some(cancel_rx.clone()),
        };
        tasks.spawn(async move { (index, service.detect(&spec, request).await) });
    }

    let mut results: Vec<(usize, DetectionResult)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("Задача детекции завершилась аварийно")?);
    }
    cancel_task.abort();
    results.sort_by_key(|(index, _)| *index);
    let results: Vec<DetectionResult> = results.into_iter().map(|(_, result)| result).collect();

    if let Some(scope) = args.learn {
        learn(config, &results, scope)?;
    }

    if json {
        print_json(&results)?;
    } else {
        for result in &results {
            println!("{}", result);
        }
    }

    let failed = results.iter().filter(|r| r.is_failed()).count();
    if failed > 0 {
        anyhow::bail!("Детекция не удалась для {} из {} приложений", failed, results.len());
    }
    Ok(())
}

fn learn(config: &Config, results: &[DetectionResult], scope: Scope) -> Result<()> {
    let store = open_store(config)?;
    for result in results {
        let Some(class) = result.detected_class.as_deref() else {
            continue;
        };
        if let Some((existing, _)) = store.classify(class) {
            info!("Класс '{}' уже классифицирован как {}", class, existing);
            continue;
        }
        if let Some(rule) = result.suggested_rule(scope) {
            store.add_pattern(rule.clone())?;
            info!("Добавлено правило {}", rule);
        }
    }
    Ok(())
}

pub async fn reload(config: &Config) -> Result<()> {
    let connector = SwayConnector::new(config.ipc.socket_path.clone())
        .with_request_timeout(config.ipc.request_timeout());
    let mut conn = connector.connect().await?;
    conn.send_tick(&config.ipc.reload_tick).await?;
    info!("Отправлен tick '{}'", config.ipc.reload_tick);
    Ok(())
}

pub fn check(config: &Config, json: bool) -> Result<()> {
    let settings = &config.classification;
    let classes: ClassificationConfig = ClassificationStore::load(&settings.path)
        .with_context(|| format!("Файл классификации {:?} некорректен", settings.path))?;
    let report = classes.validate();
    let warnings: Vec<String> = report
        .warnings()
        .map(|w| format!("{}: {}", w.field, w.message))
        .collect();

    let registry = AppRegistry::load(&settings.registry_path)
        .with_context(|| format!("Реестр приложений {:?} некорректен", settings.registry_path))?;
    let cache = DetectionCache::load(&config.detection.cache_path, config.detection.cache_ttl_days)?;
    let dependencies = check_detection_dependencies(&config.detection);

    if json {
        return print_json(&json!({
            "classification": {
                "path": settings.path,
                "scoped_classes": classes.scoped_classes.len(),
                "global_classes": classes.global_classes.len(),
                "patterns": classes.patterns.len(),
                "warnings": warnings,
            },
            "registry_entries": registry.len(),
            "detection_cache_entries": cache.len(),
            "missing_dependencies": dependencies.missing,
        }));
    }

    println!("Классификация: {:?}", settings.path);
    println!(
        "  scoped: {}, global: {}, правил: {}",
        classes.scoped_classes.len(),
        classes.global_classes.len(),
        classes.patterns.len()
    );
    for warning in &warnings {
        println!("  предупреждение: {}", warning);
    }
    println!("Реестр приложений: {} записей", registry.len());
    println!("Кэш детекции: {} записей", cache.len());
    if dependencies.is_ok() {
        println!("Зависимости детекции: все найдены");
    } else {
        println!("Зависимости детекции: нет {}", dependencies.missing.join(", "));
    }
    Ok(())
}
