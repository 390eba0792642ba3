use anyhow::Result;
use tioga::client::snapshot;
use tioga::config::SnapConfig;

fn main() -> Result<()> {
    // Initialize logging
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SnapConfig::from_env();
    let path = snapshot::run(&config)?;
    println!("{}", path.display());
    Ok(())
}
