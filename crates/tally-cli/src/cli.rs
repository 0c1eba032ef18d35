use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Tally: inspect and maintain entity data storage",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the record ids in a bucket
    Ids(IdsArgs),
    /// Decode a record and print its fields
    Show(ShowArgs),
    /// Delete a record
    Delete(DeleteArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct IdsArgs {
    /// Bucket name, e.g. `players` or `linked/island`
    pub bucket: String,
}

#[derive(Args)]
pub struct ShowArgs {
    pub bucket: String,
    pub id: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    pub bucket: String,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids() {
        let cli = Cli::try_parse_from(["tally", "ids", "players"]).unwrap();
        if let Command::Ids(args) = cli.command {
            assert_eq!(args.bucket, "players");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_show_nested_bucket() {
        let cli = Cli::try_parse_from(["tally", "show", "linked/island", "isle-1"]).unwrap();
        if let Command::Show(args) = cli.command {
            assert_eq!(args.bucket, "linked/island");
            assert_eq!(args.id, "isle-1");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_delete_requires_id() {
        assert!(Cli::try_parse_from(["tally", "delete", "players"]).is_err());
    }

    #[test]
    fn parse_global_flags_after_command() {
        let cli = Cli::try_parse_from([
            "tally", "config", "--config", "tally.toml", "-v", "--output", "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Config));
        assert_eq!(cli.config, Some(PathBuf::from("tally.toml")));
        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
    }

    #[test]
    fn parse_defaults() {
        let cli = Cli::try_parse_from(["tally", "ids", "players"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Text));
    }
}
