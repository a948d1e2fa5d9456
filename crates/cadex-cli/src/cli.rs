use std::path::PathBuf;

use cadex_core::{
    DEFAULT_FILTER_EXPRESSION, DEFAULT_SORT_EXPRESSION, EnrichMode, FilterDirection, PortalConfig,
    SortDirection,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "cadex",
    version,
    about = "Query the cadastral registry portal and export what it finds"
)]
pub struct Cli {
    #[command(flatten)]
    pub portal: PortalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List reference values (subjects, regions, settlements, street types).
    Refs(RefsArgs),
    /// Run a search and print the collected records.
    #[command(subcommand)]
    Search(SearchCommand),
}

#[derive(Subcommand, Debug)]
pub enum SearchCommand {
    /// Search by selected reference codes and free-text address parts.
    Address(AddressArgs),
    /// Search by `;`-separated cadastral numbers and ranges.
    Cad(CadArgs),
}

// ── Portal and cache options ──

#[derive(Args, Debug, Clone)]
pub struct PortalArgs {
    /// JSON file with portal settings; flags override it.
    #[arg(long, global = true, env = "CADEX_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "CADEX_PORTAL_URL")]
    pub portal_url: Option<String>,

    #[arg(long, global = true, env = "CADEX_API_URL")]
    pub api_url: Option<String>,

    /// Reference cache database.
    #[arg(
        long,
        global = true,
        env = "CADEX_CACHE",
        default_value = "cadex-cache.duckdb"
    )]
    pub cache: PathBuf,

    #[arg(long, global = true, default_value_t = false)]
    pub no_cache: bool,

    #[arg(long, global = true, env = "CADEX_CONCURRENCY")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, value_enum)]
    pub enrich: Option<EnrichArg>,

    /// Give up when the portal session is not established in time.
    #[arg(long, global = true, default_value_t = 120)]
    pub connect_timeout: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EnrichArg {
    None,
    Html,
    Api,
}

impl EnrichArg {
    pub fn mode(self) -> Option<EnrichMode> {
        match self {
            Self::None => None,
            Self::Html => Some(EnrichMode::Html),
            Self::Api => Some(EnrichMode::Api),
        }
    }
}

impl PortalArgs {
    /// Apply command-line overrides on top of `base`.
    pub fn apply(&self, mut base: PortalConfig) -> PortalConfig {
        if let Some(url) = &self.portal_url {
            base.portal_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = &self.api_url {
            base.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(concurrency) = self.concurrency {
            base.concurrency = concurrency.max(1);
        }
        if let Some(enrich) = self.enrich {
            base.enrich = enrich.mode();
        }
        base
    }
}

// ── Reference listing ──

#[derive(Args, Debug, Clone)]
pub struct RefsArgs {
    /// Subject code to list regions for.
    #[arg(long)]
    pub subject: Option<String>,

    /// Region code to list settlement types and settlements for.
    #[arg(long, requires = "subject")]
    pub region: Option<String>,

    /// Narrow settlements to one settlement type.
    #[arg(long, requires = "region")]
    pub settlement_type: Option<String>,
}

// ── Searches ──

#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    #[arg(long)]
    pub subject: Option<String>,

    #[arg(long, requires = "subject")]
    pub region: Option<String>,

    #[arg(long, requires = "region")]
    pub settlement_type: Option<String>,

    #[arg(long, requires = "region")]
    pub settlement: Option<String>,

    #[arg(long)]
    pub street_type: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AddressArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    #[arg(long, default_value = "")]
    pub street: String,

    #[arg(long, default_value = "")]
    pub house: String,

    #[arg(long, default_value = "")]
    pub building: String,

    #[arg(long, default_value = "")]
    pub structure: String,

    #[arg(long, default_value = "")]
    pub apartment: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CadArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Cadastral numbers or ranges, e.g. `50:21:3:1;50:21:3:5-9`. Several
    /// inputs run one after another.
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Print and clear the results after each input instead of collecting
    /// everything into one listing.
    #[arg(long, default_value_t = false)]
    pub each: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Keep records whose line matches this pattern; without a value the
    /// common statuses are kept.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_FILTER_EXPRESSION)]
    pub filter: Option<String>,

    /// Drop matching records instead of keeping them.
    #[arg(long, default_value_t = false, requires = "filter")]
    pub exclude: bool,

    /// Sort by the named groups `s1`..`s9` of this pattern; without a value
    /// records sort by cadastral number.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_SORT_EXPRESSION)]
    pub sort: Option<String>,

    #[arg(long, default_value_t = false, requires = "sort")]
    pub descending: bool,

    /// Print records as JSON instead of lines.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Print each record as a card with its extended attributes.
    #[arg(long, default_value_t = false, conflicts_with = "json")]
    pub details: bool,
}

impl OutputArgs {
    pub fn filter_direction(&self) -> Option<FilterDirection> {
        self.filter.as_ref().map(|_| {
            if self.exclude {
                FilterDirection::Exclude
            } else {
                FilterDirection::Include
            }
        })
    }

    pub fn sort_direction(&self) -> Option<SortDirection> {
        self.sort.as_ref().map(|_| {
            if self.descending {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            }
        })
    }
}
