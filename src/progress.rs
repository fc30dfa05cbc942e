use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

/// Weight applied to a removed file's size.
pub const REMOVE_FACTOR: u64 = 10;
/// Weight applied to an updated file's size (displace plus rename).
pub const UPDATE_FACTOR: u64 = 110;
/// Weight applied to an added file's size.
pub const ADD_FACTOR: u64 = 100;
/// Flat cost of unlinking one backup; backup sizes are not re-measured.
pub const BACKUP_REMOVE_COST: u64 = 1000;

/// Receives progress callbacks. Methods are invoked from the reporting
/// thread only, never from the threads doing the file work.
pub trait ProgressHandler: Send {
    fn on_percent(&self, percent: u8);
    fn on_message(&self, message: &str);
    fn on_finish(&self);
}

enum Event {
    Total(u64),
    Tick(u64),
    Message(String),
}

/// Cloneable producer handle. All operations are non-blocking sends on an
/// unbounded channel, so workers never stall on progress accounting.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Sender<Event>,
}

impl ProgressSender {
    /// Publish the grand total. Call once, before any tick.
    pub fn set_total(&self, total: u64) {
        let _ = self.tx.send(Event::Total(total));
    }

    pub fn tick_remove(&self, size: u64) {
        let _ = self.tx.send(Event::Tick(size * REMOVE_FACTOR / 100));
    }

    pub fn tick_update(&self, size: u64) {
        let _ = self.tx.send(Event::Tick(size * UPDATE_FACTOR / 100));
    }

    pub fn tick_add(&self, size: u64) {
        let _ = self.tx.send(Event::Tick(size * ADD_FACTOR / 100));
    }

    pub fn tick_backup_remove(&self) {
        let _ = self.tx.send(Event::Tick(BACKUP_REMOVE_COST));
    }

    /// Deliver a phase-boundary message to the handler verbatim.
    pub fn message(&self, text: &str) {
        let _ = self.tx.send(Event::Message(text.to_string()));
    }
}

/// Folds weighted ticks into a running percentage on a dedicated thread and
/// forwards percent changes and messages to the handler. The percentage is
/// monotonic and clamped to 100, which also absorbs total-estimate drift
/// when operations are skipped after an error.
pub struct ProgressReporter {
    tx: Option<ProgressSender>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(handler: Box<dyn ProgressHandler>) -> Self {
        let (tx, rx) = unbounded::<Event>();

        let handle = thread::spawn(move || {
            let mut total: u64 = 0;
            let mut current: u64 = 0;
            let mut last_percent: Option<u8> = None;

            for event in rx.iter() {
                match event {
                    Event::Total(n) => total = n,
                    Event::Message(text) => handler.on_message(&text),
                    Event::Tick(delta) => {
                        current += delta;
                        let percent = if total == 0 {
                            100
                        } else {
                            (current * 100 / total).min(100) as u8
                        };
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            handler.on_percent(percent);
                        }
                    }
                }
            }

            handler.on_finish();
        });

        Self {
            tx: Some(ProgressSender { tx }),
            handle: Some(handle),
        }
    }

    /// Producer handle for the threads doing the actual work.
    pub fn sender(&self) -> ProgressSender {
        self.tx.clone().expect("progress reporter already shut down")
    }

    /// Drain outstanding events, then fire the handler's finish hook exactly
    /// once. Blocks until every `ProgressSender` clone has been dropped.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes progress to the log; the default for unattended runs.
pub struct LogProgressHandler;

impl ProgressHandler for LogProgressHandler {
    fn on_percent(&self, percent: u8) {
        info!("Completed {}%", percent);
    }

    fn on_message(&self, message: &str) {
        info!("System message: {}", message);
    }

    fn on_finish(&self) {
        info!("Finished");
    }
}

/// Drives an indicatif bar for interactive runs.
pub struct BarProgressHandler {
    bar: ProgressBar,
}

impl BarProgressHandler {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl Default for BarProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandler for BarProgressHandler {
    fn on_percent(&self, percent: u8) {
        self.bar.set_position(percent as u64);
    }

    fn on_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn on_finish(&self) {
        self.bar.finish_with_message("done");
    }
}
