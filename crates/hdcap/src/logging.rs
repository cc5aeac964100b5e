use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` directives apply first; `default_directive` (e.g. `"hdcap=info"`)
/// is added on top so the agent's own targets are always visible.
pub fn init(default_directive: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directive = default_directive.parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_subscriber_installs_once() {
        init("hdcap=debug").unwrap();
        assert!(init("hdcap=debug").is_err());
    }
}
