use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{tick, unbounded, Receiver};
use url::Url;

use crate::config::{self, Config, LoadOptions};
use crate::controller::Controller;
use crate::discourse::{Client, ClientConfig, ForumApi};
use crate::ledger::Ledger;
use crate::page::RemotePage;
use crate::storage::{self, Store};

/// Delay before the first ledger reconciliation after startup.
const INITIAL_SYNC_DELAY: Duration = Duration::from_secs(3);
/// Interval between periodic ledger reconciliations.
const SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Run a single fetch-read-navigate cycle, then exit.
    pub once: bool,
}

/// Builds the whole object graph and drives the timer loop until Ctrl-C.
pub fn run(opts: RunOptions) -> Result<()> {
    let config = config::load(LoadOptions::default())?;

    let store = Arc::new(Store::open(storage::Options {
        path: config.storage.path.clone(),
    })?);

    let client = Arc::new(Client::new(ClientConfig {
        base_url: config.forum.base_url.clone(),
        user_agent: config.forum.user_agent.clone(),
        http_client: None,
    })?);
    let api: Arc<dyn ForumApi> = client.clone();

    let ledger = Arc::new(Ledger::new(
        store.clone(),
        api.clone(),
        config.likes.clone(),
    ));
    client.add_observer(ledger.clone());

    let start_url = Url::parse(&config.forum.base_url)
        .context("app: invalid forum base url")?;
    let page = RemotePage::new(api.clone(), start_url);

    let mut controller = Controller::new(
        page,
        api,
        ledger.clone(),
        store,
        config.pacing.clone(),
        config.likes.clone(),
    );
    controller.on_status_change(|running| {
        tracing::info!(running, "automation status changed");
    });
    controller.on_stats_update(|stats| {
        tracing::info!(
            session = stats.session_read,
            today = stats.today_read,
            total = stats.total_read,
            likes_remaining = stats.remaining,
            "reading stats"
        );
    });

    controller.resume_if_running();
    if !controller.running() {
        controller.start();
    }
    if !controller.running() {
        // Refused to start (quota gate); nothing to drive.
        return Ok(());
    }

    if opts.once {
        run_once(&mut controller, &ledger);
        controller.stop();
        return Ok(());
    }

    run_loop(&mut controller, &ledger, &ctrl_c_channel()?, &config)
}

/// One full read cycle: scroll the current article to the bottom, which
/// records the read and performs the follow-up navigation, then stop.
fn run_once<P: crate::page::PageSurface>(controller: &mut Controller<P>, ledger: &Ledger) {
    ledger.sync_remote(true, controller.probe_post());
    // Bounded by the page length; each tick advances at least scroll_min px.
    for _ in 0..10_000 {
        if !controller.running() || controller.stats().session_read >= 1 {
            return;
        }
        controller.scroll_tick();
        controller.guard_tick();
    }
}

fn run_loop<P: crate::page::PageSurface>(
    controller: &mut Controller<P>,
    ledger: &Ledger,
    stop: &Receiver<()>,
    config: &Config,
) -> Result<()> {
    let scroll = tick(config.pacing.scroll_tick);
    let guard = tick(config.pacing.guard_tick);
    let first_sync = crossbeam_channel::after(INITIAL_SYNC_DELAY);
    let sync = tick(SYNC_INTERVAL);

    tracing::info!(base = %controller.page().current_url(), "run loop started");
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => {
                tracing::info!("interrupt received, stopping");
                controller.stop();
                return Ok(());
            }
            recv(scroll) -> _ => {
                controller.scroll_tick();
                if !controller.running() {
                    return Ok(());
                }
            }
            recv(guard) -> _ => controller.guard_tick(),
            recv(first_sync) -> _ => ledger.sync_remote(true, controller.probe_post()),
            recv(sync) -> _ => ledger.sync_remote(false, controller.probe_post()),
        }
    }
}

fn ctrl_c_channel() -> Result<Receiver<()>> {
    let (tx, rx) = unbounded();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("app: ctrl-c handler")?;
    Ok(rx)
}
