//! `fiber config`: print the effective configuration.

use std::path::Path;

pub fn execute(path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(path)?;
    print!("{}", config.to_toml_string()?);
    println!(
        "# effective: {} workers, {} async threads",
        config.worker_count(),
        config.async_worker_count()
    );
    Ok(())
}
