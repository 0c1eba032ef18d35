use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use serde_json::Value;
use tally_codec::{DataFormat, Record};
use tally_sdk::TallyConfig;
use tally_store::DataStorage;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Ids(args) => cmd_ids(&config, args, &cli.output),
        Command::Show(args) => cmd_show(&config, args, &cli.output),
        Command::Delete(args) => cmd_delete(&config, args),
        Command::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TallyConfig> {
    match path {
        Some(path) => TallyConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(TallyConfig::default()),
    }
}

fn cmd_ids(config: &TallyConfig, args: IdsArgs, output: &OutputFormat) -> anyhow::Result<()> {
    let storage = config.open_storage();
    let mut ids = storage.list_ids(&args.bucket)?;
    ids.sort();
    debug!(bucket = %args.bucket, count = ids.len(), "listed records");
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ids)?),
        OutputFormat::Text => {
            if ids.is_empty() {
                println!("No records in {}.", args.bucket.bold());
            }
            for id in &ids {
                println!("{id}");
            }
        }
    }
    Ok(())
}

fn cmd_show(config: &TallyConfig, args: ShowArgs, output: &OutputFormat) -> anyhow::Result<()> {
    let storage = config.open_storage();
    let bytes = storage
        .load(&args.bucket, &args.id)?
        .with_context(|| format!("no record {} in {}", args.id, args.bucket))?;
    let record = config
        .format
        .decode_record(&bytes)
        .with_context(|| format!("decoding {} record {}", config.format, args.id))?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&record_json(config.format, &record))?)
        }
        OutputFormat::Text => {
            println!("{} {}/{}", "Record".bold(), args.bucket.cyan(), args.id.yellow());
            if record.is_empty() {
                println!("  (no fields)");
            }
            for (key, bytes) in &record {
                println!("  {} = {}", key.green(), render_value(config.format, bytes));
            }
        }
    }
    Ok(())
}

fn cmd_delete(config: &TallyConfig, args: DeleteArgs) -> anyhow::Result<()> {
    let storage = config.open_storage();
    if storage.delete(&args.bucket, &args.id)? {
        println!("{} Deleted {}/{}", "✓".green(), args.bucket, args.id.yellow());
    } else {
        println!("No record {} in {}.", args.id.yellow(), args.bucket.bold());
    }
    Ok(())
}

fn cmd_config(config: &TallyConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

/// One field value as text. JSON values print as-is; binary values are opaque
/// without their codec, so only the size is shown.
fn render_value(format: DataFormat, bytes: &[u8]) -> String {
    match format {
        DataFormat::Json => String::from_utf8_lossy(bytes).into_owned(),
        DataFormat::Binary => format!("<{} bytes>", bytes.len()),
    }
}

fn record_json(format: DataFormat, record: &Record) -> Value {
    let fields = record
        .iter()
        .map(|(key, bytes)| {
            let value = match format {
                DataFormat::Json => serde_json::from_slice(bytes)
                    .unwrap_or_else(|_| Value::String(render_value(format, bytes))),
                DataFormat::Binary => Value::String(render_value(format, bytes)),
            };
            (key.clone(), value)
        })
        .collect();
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_render_verbatim() {
        assert_eq!(render_value(DataFormat::Json, b"{\"a\":1}"), "{\"a\":1}");
        assert_eq!(render_value(DataFormat::Binary, &[1, 2, 3]), "<3 bytes>");
    }

    #[test]
    fn record_json_nests_values() {
        let mut record = Record::new();
        record.insert("economy:coins".into(), b"500".to_vec());
        record.insert("profile:title".into(), b"\"knight\"".to_vec());
        let json = record_json(DataFormat::Json, &record);
        assert_eq!(json["economy:coins"], 500);
        assert_eq!(json["profile:title"], "knight");
    }

    #[test]
    fn missing_config_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
        assert_eq!(load_config(None).unwrap(), TallyConfig::default());
    }
}
