//! Process environment: knob parsing and tracing setup.
use std::{
    env,
    fmt::Debug,
    fs::File,
    io,
    str::FromStr,
};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    Layer,
    Registry,
    fmt::{
        MakeWriter,
        format::format,
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Read a knob from the environment. Unset, non-unicode and unparseable
/// values all fall back to `default`; the last two log a warning.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(_)) => {
            tracing::warn!("{name} is not unicode, using {default:?}");
            return default;
        },
    };
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::info!("{name} overridden to {value:?}");
            value
        },
        Err(e) => {
            tracing::warn!("{name}={raw:?} does not parse ({e:?}), using {default:?}");
            default
        },
    }
}

/// Event format selected by `LOG_FORMAT`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Keeps the `CATALOG_TRACE_FILE` writer flushing. Hold it for the life of
/// the process.
pub struct TracingGuard {
    _file_writer: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Tracing for command line tools: errors only, to stderr.
pub fn config_tool() -> TracingGuard {
    config_tracing(io::stderr, Level::ERROR)
}

/// Tracing for long running processes: info and up, to stdout.
pub fn config_service() -> TracingGuard {
    config_tracing(io::stdout, Level::INFO)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn config_tracing<W>(writer: W, default_level: Level) -> TracingGuard
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
    };
    let stdio = tracing_subscriber::fmt::layer()
        .with_ansi(env::var_os("NO_COLOR").is_none())
        .with_writer(writer);
    let stdio: BoxedLayer = match env_config("LOG_FORMAT", LogFormat::default()) {
        LogFormat::Compact => stdio.event_format(format().compact()).with_filter(filter()).boxed(),
        LogFormat::Pretty => stdio.event_format(format().pretty()).with_filter(filter()).boxed(),
        LogFormat::Json => stdio.event_format(format().json()).with_filter(filter()).boxed(),
    };
    let mut layers = vec![stdio];

    let mut file_writer = None;
    if let Some(path) = env::var_os("CATALOG_TRACE_FILE") {
        match File::create(&path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(filter())
                        .boxed(),
                );
                file_writer = Some(guard);
            },
            Err(e) => eprintln!("Not tracing to {}: {e}", path.to_string_lossy()),
        }
    }
    tracing_subscriber::registry().with(layers).init();
    TracingGuard {
        _file_writer: file_writer,
    }
}

/// Route tracing into the test harness's captured output. Safe to call from
/// every test; only the first call installs a subscriber.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
