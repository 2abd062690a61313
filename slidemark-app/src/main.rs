use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use slidemark_config::{AppConfig, ConfigError};
use slidemark_core::annotation::AnnotationSet;
use slidemark_core::geometry::Vector2;
use slidemark_engine::command::CommandBus;
use slidemark_engine::session::{EditConfig, EditSession};
use slidemark_io::{
    AsapXml, AutosaveThrottle, GeoJson, IoError, TaskSubmitter, ThreadSubmitter, load_into,
    save_async,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod cli;

#[derive(Debug, Default)]
struct CliArgs {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    mpp: Option<Vector2>,
    commands: Vec<String>,
    config: Option<PathBuf>,
}

fn main() {
    let args = parse_args();
    let config = load_configuration(args.config.clone());
    init_logging(&config);
    info!("启动 slidemark");

    let mpp = args.mpp.unwrap_or_else(|| {
        let [x, y] = config.persistence.default_mpp;
        Vector2::new(x, y)
    });
    let mut set = AnnotationSet::new(mpp);
    if let Some(input) = &args.input {
        if load_annotations(&mut set, input).is_err() {
            eprintln!("无法加载 {}，使用空的标注集合", input.display());
        }
    }

    let mut session = EditSession::new(set, edit_config(&config));
    cli::print_summary(&mut session);

    let workers = ThreadSubmitter::new();
    let mut throttle = AutosaveThrottle::new(
        Duration::from_secs(config.persistence.autosave_interval_secs),
        Duration::from_secs(config.persistence.autosave_idle_secs),
    );
    let output = args.output.clone().or_else(|| args.input.clone());
    let bus = CommandBus::new();
    for command in &args.commands {
        if let Err(message) = cli::dispatch_cli_command(&bus, command, &mut session) {
            warn!(command = %command, "命令执行失败: {message}");
            eprintln!("命令 {command} 执行失败: {message}");
        }
        let now = Instant::now();
        if let Some(path) = &output {
            if throttle.should_save(session.annotations(), now) {
                save_annotations(session.annotations(), path, &config, &workers);
                throttle.record_save(now);
            }
        }
    }

    if !args.commands.is_empty() {
        cli::print_summary(&mut session);
    }

    match &output {
        Some(path) if args.output.is_some() || session.annotations().is_modified() => {
            save_annotations(session.annotations(), path, &config, &workers);
        }
        Some(_) => info!("没有未保存的修改"),
        None => {}
    }
    workers.join_all();
    if output.is_some() && session.annotations().is_modified() {
        warn!("退出时源文件仍有未写盘的修改");
    }
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next().unwrap_or_else(|| {
                eprintln!("`{flag}` 需要提供参数");
                std::process::exit(1);
            })
        };
        match arg.as_str() {
            "--input" => parsed.input = Some(PathBuf::from(value("--input"))),
            "--output" => parsed.output = Some(PathBuf::from(value("--output"))),
            "--config" => parsed.config = Some(PathBuf::from(value("--config"))),
            "--command" => parsed.commands.push(value("--command")),
            "--mpp" => {
                let raw = value("--mpp");
                let Some(mpp) = parse_mpp(&raw) else {
                    eprintln!("无法解析 mpp：{raw}（期望 x,y）");
                    std::process::exit(1);
                };
                parsed.mpp = Some(mpp);
            }
            other => {
                eprintln!("未知参数：{other}");
                std::process::exit(1);
            }
        }
    }
    parsed
}

/// `0.25` 或 `0.25,0.26`。
fn parse_mpp(raw: &str) -> Option<Vector2> {
    let mut parts = raw.split(',').map(|part| part.trim().parse::<f64>());
    let x = parts.next()?.ok()?;
    let y = match parts.next() {
        Some(value) => value.ok()?,
        None => x,
    };
    if parts.next().is_some() || !(x > 0.0 && y > 0.0) {
        return None;
    }
    Some(Vector2::new(x, y))
}

fn is_geojson(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("geojson"))
}

fn load_annotations(set: &mut AnnotationSet, path: &Path) -> Result<(), IoError> {
    if is_geojson(path) {
        load_into(set, path, &GeoJson::new())
    } else {
        load_into(set, path, &AsapXml::new())
    }
}

fn save_annotations(
    set: &AnnotationSet,
    path: &Path,
    config: &AppConfig,
    submitter: &dyn TaskSubmitter,
) {
    let backup = config.persistence.create_backup;
    if is_geojson(path) {
        save_async(set, path, GeoJson::new(), backup, submitter);
    } else {
        save_async(set, path, AsapXml::new(), backup, submitter);
    }
}

fn edit_config(config: &AppConfig) -> EditConfig {
    let editing = &config.editing;
    EditConfig {
        freeform_spacing: editing.freeform_spacing,
        hover_tolerance: editing.hover_tolerance,
        selection_bias: editing.selection_bias,
        bounds_tolerance: editing.bounds_tolerance,
        split_enabled: editing.split_enabled,
    }
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
