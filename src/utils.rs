use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Component, Utf8Path};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_PASS: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

pub(crate) fn style_pass() -> ProgressStyle {
    STYLE_PASS.clone()
}

pub(crate) fn style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Lexically normalizes an absolute path: `.` is dropped, `..` pops a
/// component and never climbs above the root.
pub(crate) fn normalize_path(path: &Utf8Path) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Utf8Component::Normal(part) => parts.push(part),
            Utf8Component::ParentDir => {
                parts.pop();
            }
            Utf8Component::CurDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Installs a global subscriber printing through the progress bars.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing::Level;
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Utf8Path::new("/a/./b/../c")), "/a/c");
        assert_eq!(normalize_path(Utf8Path::new("/../..")), "/");
        assert_eq!(normalize_path(Utf8Path::new("rel/x")), "/rel/x");
    }
}
