use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

mod classification;
mod cli;
mod config;
mod error;
mod events;
mod resolver;
mod services;
mod utils;

use classification::Scope;
use config::Config;
use error::ScopeError;

#[derive(Parser, Debug)]
#[command(name = "scopewm")]
#[command(version)]
#[command(about = "Классификация окон sway/i3 по проектам: scoped или global")]
struct Args {
    /// Путь к файлу настроек
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Уровень логирования (перекрывает настройки, RUST_LOG важнее)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Машиночитаемый вывод (JSON)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Запустить демон событий
    Daemon {
        /// Только логировать команды, не отправляя их оконному менеджеру
        #[arg(long)]
        dry_run: bool,
    },
    /// Правила классификации по паттернам
    #[command(subcommand)]
    Pattern(PatternCommand),
    /// Явные списки scoped_classes / global_classes
    #[command(subcommand)]
    Class(ClassCommand),
    /// Определить класс окна приложения
    Detect(DetectArgs),
    /// Попросить запущенный демон перечитать классификацию
    Reload,
    /// Проверить файлы настроек и зависимости
    Check,
}

#[derive(Subcommand, Debug)]
enum PatternCommand {
    /// Добавить правило (`glob:`, `regex:` или точное имя)
    Add {
        pattern: String,
        #[arg(short, long)]
        scope: Scope,
        #[arg(short, long, default_value_t = 0)]
        priority: u32,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Удалить все правила с этим текстом
    Remove { pattern: String },
    List,
    /// Показать, как будет классифицирован класс окна
    Test { class: String },
}

#[derive(Subcommand, Debug)]
enum ClassCommand {
    Add {
        class: String,
        #[arg(short, long)]
        scope: Scope,
    },
    Remove { class: String },
    List,
}

#[derive(ClapArgs, Debug)]
pub struct DetectArgs {
    /// Команда запуска с аргументами
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required_unless_present = "batch")]
    pub command: Vec<String>,

    /// Файл со списком команд, по одной на строку
    #[arg(long, conflicts_with = "command")]
    pub batch: Option<PathBuf>,

    /// .desktop-файл приложения (StartupWMClass)
    #[arg(long)]
    pub desktop_file: Option<PathBuf>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Не читать кэш детекции
    #[arg(long)]
    pub no_cache: bool,

    /// Добавить правило для найденного класса
    #[arg(long)]
    pub learn: Option<Scope>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(utils::paths::settings_path);

    let loaded = Config::load(&config_path);
    let (level, format) = match &loaded {
        Ok(config) => (
            args.log_level.clone().unwrap_or_else(|| config.logging.level.clone()),
            config.logging.format.clone(),
        ),
        Err(_) => (
            args.log_level.clone().unwrap_or_else(|| "info".to_string()),
            "compact".to_string(),
        ),
    };

    if let Err(e) = init_tracing(&level, &format) {
        eprintln!("Не удалось настроить логирование: {:#}", e);
        return ExitCode::from(1);
    }

    let result = match loaded {
        Ok(config) => run(args, config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let json = args.json;
    match args.command {
        Command::Daemon { dry_run } => {
            info!("Запуск scopewm v{}", env!("CARGO_PKG_VERSION"));
            cli::run_daemon(config, dry_run).await
        }
        Command::Pattern(command) => match command {
            PatternCommand::Add {
                pattern,
                scope,
                priority,
                description,
            } => cli::pattern_add(&config, pattern, scope, priority, description, json),
            PatternCommand::Remove { pattern } => cli::pattern_remove(&config, &pattern, json),
            PatternCommand::List => cli::pattern_list(&config, json),
            PatternCommand::Test { class } => cli::pattern_test(&config, &class, json),
        },
        Command::Class(command) => match command {
            ClassCommand::Add { class, scope } => cli::class_add(&config, &class, scope, json),
            ClassCommand::Remove { class } => cli::class_remove(&config, &class, json),
            ClassCommand::List => cli::class_list(&config, json),
        },
        Command::Detect(detect) => cli::detect(&config, detect, json).await,
        Command::Reload => cli::reload(&config).await,
        Command::Check => cli::check(&config, json),
    }
}

/// Код выхода берётся из первой ScopeError в цепочке причин
fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ScopeError>())
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

fn init_tracing(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Неверный уровень логирования: {}", level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        "json" => registry.with(fmt.json()).init(),
        "pretty" => registry.with(fmt.pretty()).init(),
        _ => registry.with(fmt.compact()).init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_error_chain() {
        let err = anyhow::Error::new(ScopeError::DependencyMissing("Xvfb".into())).context("детекция");
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::anyhow!("что-то другое");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_detect_args_keep_command_flags() {
        let args = Args::try_parse_from(["scopewm", "detect", "--no-cache", "code", "--new-window"]).unwrap();
        match args.command {
            Command::Detect(detect) => {
                assert!(detect.no_cache);
                assert_eq!(detect.command, vec!["code", "--new-window"]);
            }
            other => panic!("неожиданная команда: {:?}", other),
        }
    }

    #[test]
    fn test_pattern_add_parses_scope() {
        let args = Args::try_parse_from(["scopewm", "--json", "pattern", "add", "glob:Code*", "--scope", "scoped"]).unwrap();
        assert!(args.json);
        assert!(matches!(
            args.command,
            Command::Pattern(PatternCommand::Add { scope: Scope::Scoped, priority: 0, .. })
        ));
    }
}
