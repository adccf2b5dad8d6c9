use schemars::schema_for;

use crate::config::{CONFIG_TOML, Config};

/// Print the JSON Schema for `.evolver.toml` to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let mut schema = schema_for!(Config);
    if let Some(meta) = schema.schema.metadata.as_mut() {
        meta.title = Some(CONFIG_TOML.to_string());
    }
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
