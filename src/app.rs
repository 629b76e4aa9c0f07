use crate::cache::Manifest;
use crate::commands::Command;
use crate::config::Config;
use crate::directory::client::Queued;
use crate::directory::types::Restaurant;
use crate::directory::{url_for_restaurant, NewReview, RestaurantClient};
use crate::event::{ConnectivityMonitor, Event, EventHandler};
use crate::net::Request;
use crate::sync::{DrainOutcome, Trigger};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Main application state
pub struct App {
  /// Directory client
  client: RestaurantClient,

  /// Application configuration
  config: Config,

  /// Whether to quit the watch loop
  should_quit: bool,
}

#[derive(Serialize)]
struct PendingEntry<'a> {
  id: Option<i64>,
  method: Option<&'a str>,
  url: Option<&'a str>,
  body: Option<&'a Value>,
}

/// Restaurant plus the link to its detail page.
#[derive(Serialize)]
struct Listed {
  url: String,
  #[serde(flatten)]
  restaurant: Restaurant,
}

#[derive(Serialize)]
struct FetchSummary<'a> {
  status: u16,
  status_text: &'a str,
  source: String,
  content_type: Option<&'a str>,
  bytes: usize,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = RestaurantClient::open(&config)?;
    Ok(Self::with_client(config, client))
  }

  pub fn with_client(config: Config, client: RestaurantClient) -> Self {
    Self {
      client,
      config,
      should_quit: false,
    }
  }

  /// Run one subcommand, writing its result as JSON to `out`.
  ///
  /// Every command except the queue inspection ones first tries to deliver
  /// writes queued by earlier runs.
  pub async fn execute(&mut self, command: Command, out: &mut impl Write) -> Result<()> {
    if command.drains_on_start() {
      self.drain(Trigger::Load).await;
    }

    match command {
      Command::Install { manifest } => {
        let path = manifest
          .or_else(|| self.config.manifest.clone())
          .ok_or_else(|| eyre!("No manifest given and none configured"))?;
        let report = self.client.install(&Manifest::load(&path)?).await?;
        if !report.failed.is_empty() {
          warn!(failed = report.failed.len(), "Some assets could not be cached");
        }
        print_json(out, &report)
      }
      Command::Fetch { url } => {
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
        let response = self.client.interceptor().fetch(Request::get(url)).await?;
        print_json(
          out,
          &FetchSummary {
            status: response.status,
            status_text: &response.status_text,
            source: format!("{:?}", response.source),
            content_type: response.content_type.as_deref(),
            bytes: response.body.len(),
          },
        )
      }
      Command::Restaurants {
        cuisine,
        neighborhood,
      } => {
        let listed: Vec<Listed> = self
          .client
          .restaurants_by(&cuisine, &neighborhood)
          .await?
          .into_iter()
          .map(|restaurant| Listed {
            url: url_for_restaurant(restaurant.id),
            restaurant,
          })
          .collect();
        print_json(out, &listed)
      }
      Command::Restaurant { id } => print_json(out, &self.client.restaurant(id).await?),
      Command::Neighborhoods => print_json(out, &self.client.neighborhoods().await?),
      Command::Cuisines => print_json(out, &self.client.cuisines().await?),
      Command::Reviews { id } => print_json(out, &self.client.reviews(id).await?),
      Command::Favorite { id, state } => {
        let queued = self.client.toggle_favorite(id, state)?;
        self.report_queued(queued, out).await
      }
      Command::Review {
        id,
        name,
        rating,
        comments,
      } => {
        let review = NewReview {
          restaurant_id: id,
          name,
          rating,
          comments,
        };
        let queued = self.client.publish_review(&review)?;
        self.report_queued(queued, out).await
      }
      Command::Pending => {
        let pending = self.client.queue().pending()?;
        let entries: Vec<PendingEntry> = pending
          .iter()
          .map(|record| PendingEntry {
            id: record.id,
            method: record.data.method.as_deref(),
            url: record.data.url.as_deref(),
            body: record.data.body.as_ref(),
          })
          .collect();
        print_json(out, &entries)
      }
      Command::Sync => {
        let outcome = self.client.sync(Trigger::Manual).await;
        print_json(out, &outcome_summary(outcome))
      }
      Command::Watch => self.run().await,
    }
  }

  /// Stay running until Ctrl-C, draining on start and whenever the API comes back.
  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new();
    let tx = events.sender();

    let monitor = ConnectivityMonitor::new(
      Arc::clone(self.client.interceptor().transport()),
      self.config.api_url()?,
      self.config.poll_interval(),
    );
    let poller = monitor.spawn(events.sender());

    let shutdown = events.sender();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown.send(Event::Shutdown);
      }
    });

    let _ = tx.send(Event::Load);
    info!(api = %self.config.api_url, "Watching for connectivity changes");

    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event).await,
        None => break,
      }
    }

    poller.abort();
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) {
    debug!(?event, "Handling event");
    match event {
      Event::Load => self.drain(Trigger::Load).await,
      Event::Online => self.drain(Trigger::Online).await,
      Event::Offline => info!("API unreachable, writes will stay queued"),
      Event::Shutdown => self.should_quit = true,
    }
  }

  async fn drain(&self, trigger: Trigger) {
    match self.client.sync(trigger).await {
      DrainOutcome::Halted { remaining, .. } => {
        warn!(?trigger, remaining, "Sync halted")
      }
      outcome => debug!(?trigger, ?outcome, "Sync finished"),
    }
  }

  async fn report_queued(&self, queued: Queued, out: &mut impl Write) -> Result<()> {
    let outcome = queued
      .drain
      .await
      .map_err(|e| eyre!("Sync task failed: {}", e))?;
    print_json(
      out,
      &QueuedSummary {
        pending_id: queued.pending_id,
        cached_list: queued.patched.aggregate,
        cached_detail: queued.patched.detail,
        sync: outcome_summary(outcome),
      },
    )
  }
}

#[derive(Serialize)]
struct QueuedSummary {
  pending_id: i64,
  cached_list: bool,
  cached_detail: bool,
  sync: OutcomeSummary,
}

#[derive(Debug, Serialize, PartialEq)]
struct OutcomeSummary {
  status: &'static str,
  sent: usize,
  discarded: usize,
  remaining: usize,
}

fn outcome_summary(outcome: DrainOutcome) -> OutcomeSummary {
  match outcome {
    DrainOutcome::Drained { sent, discarded } => OutcomeSummary {
      status: "drained",
      sent,
      discarded,
      remaining: 0,
    },
    DrainOutcome::Halted {
      sent,
      discarded,
      remaining,
    } => OutcomeSummary {
      status: "halted",
      sent,
      discarded,
      remaining,
    },
    DrainOutcome::Busy => OutcomeSummary {
      status: "busy",
      sent: 0,
      discarded: 0,
      remaining: 0,
    },
  }
}

fn print_json<T: Serialize + ?Sized>(out: &mut impl Write, value: &T) -> Result<()> {
  serde_json::to_writer_pretty(&mut *out, value)
    .map_err(|e| eyre!("Failed to write output: {}", e))?;
  writeln!(out)?;
  Ok(())
}
