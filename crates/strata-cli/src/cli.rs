use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata: layered content-addressed blob storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Provider configuration file
    #[arg(short, long, global = true, default_value = "strata.toml")]
    pub config: PathBuf,

    /// Raise the log level (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file and print its key
    Put(PutArgs),
    /// Read a blob to stdout or a file
    Get(GetArgs),
    /// Delete a blob
    Rm(RmArgs),
    /// Show a blob's storage tier
    Status(StatusArgs),
    /// Change a blob's storage class, restore it, or set a legal hold
    Update(UpdateArgs),
    /// Delete every blob not listed in a keep file
    Gc(GcArgs),
    /// Validate the configuration and list providers
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct PutArgs {
    pub file: PathBuf,
    /// Target provider (defaults to the configured default)
    #[arg(short, long)]
    pub provider: Option<String>,
    /// Owning document id, for document-keyed providers
    #[arg(long)]
    pub doc: Option<String>,
    #[arg(long, requires = "doc")]
    pub xpath: Option<String>,
    #[arg(long)]
    pub mime_type: Option<String>,
}

#[derive(Args)]
pub struct GetArgs {
    /// Provider-qualified key (`provider:key`)
    pub key: String,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct RmArgs {
    pub keys: Vec<String>,
}

#[derive(Args)]
pub struct StatusArgs {
    pub key: String,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("change")
        .required(true)
        .args(["storage_class", "restore", "legal_hold", "retain_days"]),
))]
pub struct UpdateArgs {
    pub key: String,
    /// STANDARD, INFREQUENT_ACCESS, GLACIER or DEEP_ARCHIVE
    #[arg(long)]
    pub storage_class: Option<String>,
    /// Restore an archived blob for this many days
    #[arg(long)]
    pub restore: Option<u32>,
    #[arg(long)]
    pub legal_hold: Option<bool>,
    /// Refuse deletes for this many days from now; 0 lifts the retention
    #[arg(long)]
    pub retain_days: Option<u64>,
}

#[derive(Args)]
pub struct GcArgs {
    /// File of keys still referenced, one per line
    #[arg(long)]
    pub keep: PathBuf,
    #[arg(short, long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Only parse and validate, without opening any store
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_put() {
        let cli = Cli::try_parse_from(["strata", "put", "a.pdf", "-p", "media", "--mime-type", "application/pdf"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.file, PathBuf::from("a.pdf"));
            assert_eq!(args.provider, Some("media".into()));
            assert_eq!(args.mime_type, Some("application/pdf".into()));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_xpath_needs_doc() {
        assert!(Cli::try_parse_from(["strata", "put", "a", "--xpath", "files/0/file"]).is_err());
        let cli = Cli::try_parse_from(["strata", "put", "a", "--doc", "d1", "--xpath", "files/0/file"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.doc, Some("d1".into()));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_get_output() {
        let cli = Cli::try_parse_from(["strata", "get", "media:abc", "-o", "out.bin"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.key, "media:abc");
            assert_eq!(args.output, Some(PathBuf::from("out.bin")));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_rm_many() {
        let cli = Cli::try_parse_from(["strata", "rm", "a", "b"]).unwrap();
        if let Command::Rm(args) = cli.command {
            assert_eq!(args.keys, vec!["a", "b"]);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_update_requires_a_change() {
        assert!(Cli::try_parse_from(["strata", "update", "k"]).is_err());
        assert!(Cli::try_parse_from(["strata", "update", "k", "--restore", "2", "--legal-hold", "true"]).is_err());
        let cli = Cli::try_parse_from(["strata", "update", "k", "--legal-hold", "false"]).unwrap();
        if let Command::Update(args) = cli.command {
            assert_eq!(args.legal_hold, Some(false));
        } else { panic!("wrong command"); }
        let cli = Cli::try_parse_from(["strata", "update", "k", "--retain-days", "30"]).unwrap();
        if let Command::Update(args) = cli.command {
            assert_eq!(args.retain_days, Some(30));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_gc_dry_run() {
        let cli = Cli::try_parse_from(["strata", "gc", "--keep", "refs.txt", "--dry-run"]).unwrap();
        if let Command::Gc(args) = cli.command {
            assert!(args.dry_run);
            assert_eq!(args.keep, PathBuf::from("refs.txt"));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from(["strata", "-vv", "--config", "/etc/strata.toml", "--format", "json", "config"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from("/etc/strata.toml"));
        assert!(matches!(cli.format, OutputFormat::Json));
        assert!(matches!(cli.command, Command::Config(_)));
    }
}
