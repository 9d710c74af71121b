use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version,
    about = "Transparent intercepting firewall for HTTP backends"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "portcullis.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Backend target address (overrides config file setting)
    #[arg(long)]
    pub target: Option<String>,

    /// Rule root directory (overrides config file setting)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Journal output path (overrides config file setting)
    #[arg(long)]
    pub journal: Option<PathBuf>,
}
