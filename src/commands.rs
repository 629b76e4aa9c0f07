/// Command-line subcommands
use clap::Subcommand;
use std::path::PathBuf;

use crate::directory::ANY;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Fetch every asset in the build manifest into the offline cache
  Install {
    /// Manifest to install from (default: `manifest` in the config file)
    #[arg(short, long)]
    manifest: Option<PathBuf>,
  },
  /// Send one GET request through the cache and print the response
  Fetch { url: String },
  /// List restaurants, optionally filtered
  #[command(visible_alias = "r")]
  Restaurants {
    #[arg(long, default_value = ANY)]
    cuisine: String,
    #[arg(long, default_value = ANY)]
    neighborhood: String,
  },
  /// Show one restaurant
  Restaurant { id: i64 },
  /// Distinct neighborhoods across all restaurants
  Neighborhoods,
  /// Distinct cuisines across all restaurants
  Cuisines,
  /// Reviews of one restaurant
  Reviews { id: i64 },
  /// Mark or unmark a restaurant as favorite
  #[command(visible_alias = "fav")]
  Favorite {
    id: i64,
    #[arg(action = clap::ArgAction::Set)]
    state: bool,
  },
  /// Write a review
  Review {
    id: i64,
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    rating: u8,
    #[arg(long, default_value = "")]
    comments: String,
  },
  /// List mutations waiting to be sent
  Pending,
  /// Send queued mutations now
  Sync,
  /// Stay running and sync whenever the API becomes reachable
  Watch,
}

impl Command {
  /// Whether queued writes should be delivered before the command runs, the
  /// way every application start does.
  pub fn drains_on_start(&self) -> bool {
    !matches!(self, Command::Pending | Command::Sync | Command::Watch)
  }
}
